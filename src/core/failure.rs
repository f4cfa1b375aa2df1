/*
 * A recoverable failure tied to the item it happened on. Batch operations collect
 * these into their reports instead of aborting, so a caller can see exactly which
 * layers or plan rows were skipped and why.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure<I, E> {
    pub item: I,
    pub cause: E,
}

impl<I, E> ItemFailure<I, E> {
    pub fn new(item: I, cause: E) -> Self {
        ItemFailure { item, cause }
    }
}

impl<I: std::fmt::Display, E: std::fmt::Display> std::fmt::Display for ItemFailure<I, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.item, self.cause)
    }
}
