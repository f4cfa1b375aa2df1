/*
 * Classification pipeline: turns exported artifacts into categories.
 *
 * Each artifact is sent to the recognition service and the free-text label that
 * comes back is matched against an ordered table of category rules. The first rule
 * with a keyword occurring in the label wins; nothing matching means
 * `unclassified`. A visual tier (background, midground, foreground) is derived from
 * the same label so plans can group by depth as well.
 *
 * The access token is obtained once per run. Without it nothing can be classified,
 * so a token failure ends the run; a failure on a single artifact only marks that
 * artifact as failed.
 */
use super::export::CaptureArtifact;
use super::failure::ItemFailure;
use super::layer_tree::LayerId;
use super::plan::{PlanTarget, RenamePlanEntry};
use super::recognition::{AccessToken, Credentials, RecognitionError, RecognitionOperations};
use serde::{Deserialize, Serialize};

pub const UNCLASSIFIED: &str = "unclassified";
pub const FAILED_LABEL: &str = "failed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: String,
    pub keywords: Vec<String>,
}

impl CategoryRule {
    pub fn new(category: &str, keywords: &[&str]) -> Self {
        CategoryRule {
            category: category.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    // Blank keywords would match every label and are ignored.
    pub fn matches(&self, label: &str) -> bool {
        self.keywords
            .iter()
            .any(|keyword| !keyword.is_empty() && label.contains(keyword.as_str()))
    }
}

pub fn default_category_rules() -> Vec<CategoryRule> {
    vec![
        CategoryRule::new(
            "Text",
            &["文字", "标题", "字体", "数字", "字母", "文本", "汉字", "text", "title", "font", "letter"],
        ),
        CategoryRule::new(
            "Background",
            &["背景", "纹理", "底色", "渐变", "地图", "纯色", "background", "texture", "gradient"],
        ),
        CategoryRule::new(
            "Shape",
            &["矩形", "圆形", "形状", "线条", "边框", "椭圆", "多边形", "shape", "line", "border"],
        ),
        CategoryRule::new(
            "Asset",
            &[
                "人物", "风景", "产品", "图标", "图片", "图案", "person", "landscape", "product",
                "icon", "picture", "pattern",
            ],
        ),
        CategoryRule::new("Path", &["路径", "钢笔", "描边", "轮廓", "path", "stroke", "outline"]),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRuleSet {
    rules: Vec<CategoryRule>,
}

impl CategoryRuleSet {
    pub fn new(rules: Vec<CategoryRule>) -> Self {
        CategoryRuleSet { rules }
    }

    /// Category of the first rule that matches, in table order.
    pub fn match_label(&self, label: &str) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.matches(label))
            .map(|rule| rule.category.as_str())
            .unwrap_or(UNCLASSIFIED)
    }
}

impl Default for CategoryRuleSet {
    fn default() -> Self {
        Self::new(default_category_rules())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisualTier {
    Background,
    Midground,
    Foreground,
}

impl VisualTier {
    pub fn as_str(self) -> &'static str {
        match self {
            VisualTier::Background => "Background",
            VisualTier::Midground => "Midground",
            VisualTier::Foreground => "Foreground",
        }
    }
}

impl std::fmt::Display for VisualTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/*
 * Keywords and categories that place a layer at the back or at the front.
 * Background is checked first; anything else recognised sits in the middle.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierRules {
    pub background_keywords: Vec<String>,
    pub background_categories: Vec<String>,
    pub foreground_keywords: Vec<String>,
    pub foreground_categories: Vec<String>,
}

impl Default for TierRules {
    fn default() -> Self {
        let owned = |words: &[&str]| words.iter().map(|w| w.to_string()).collect();
        TierRules {
            background_keywords: owned(&[
                "背景", "纹理", "底色", "底纹", "风景", "景物", "background", "texture", "scenery",
            ]),
            background_categories: owned(&["Background"]),
            foreground_keywords: owned(&[
                "文字", "标题", "按钮", "图标", "人物", "头像", "装饰", "logo", "标志", "水印",
                "text", "title", "button", "icon", "person",
            ]),
            foreground_categories: owned(&["Text"]),
        }
    }
}

impl TierRules {
    pub fn derive_tier(&self, label: &str, category: &str) -> Option<VisualTier> {
        let label = label.trim();
        if label.is_empty() || label == FAILED_LABEL {
            return None;
        }
        let hit = |keywords: &[String], categories: &[String]| {
            categories.iter().any(|c| c == category)
                || keywords.iter().any(|k| !k.is_empty() && label.contains(k.as_str()))
        };
        if hit(&self.background_keywords, &self.background_categories) {
            Some(VisualTier::Background)
        } else if hit(&self.foreground_keywords, &self.foreground_categories) {
            Some(VisualTier::Foreground)
        } else {
            Some(VisualTier::Midground)
        }
    }
}

/*
 * Turns a recognised label into a short layer name. A colour word and a content
 * word found in the label are combined ("红色按钮"). Otherwise the first clause of
 * the label, stripped of filler words, is shortened. Labels without any content
 * word get `default_name`.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerNameRules {
    pub color_keywords: Vec<String>,
    pub type_keywords: Vec<String>,
    pub filler_words: Vec<String>,
    pub clause_separator: String,
    // Characters kept from the first clause after a colour word.
    pub color_fragment_len: usize,
    pub fragment_len: usize,
    pub max_len: usize,
    pub default_name: String,
}

impl Default for LayerNameRules {
    fn default() -> Self {
        let owned = |words: &[&str]| words.iter().map(|w| w.to_string()).collect();
        LayerNameRules {
            color_keywords: owned(&[
                "红色", "蓝色", "绿色", "黄色", "紫色", "橙色", "粉色", "黑色", "白色", "灰色",
                "棕色", "金色", "银色",
            ]),
            type_keywords: owned(&[
                "标题", "文字", "文本", "按钮", "图标", "背景", "纹理", "图片", "图像", "照片",
                "标志", "logo", "装饰", "边框", "形状", "人物", "头像", "动物", "植物", "建筑",
                "风景", "插图", "插画", "水印", "线条", "圆形", "方形", "三角形", "星星", "心形",
                "箭头", "符号", "图案", "网格", "渐变", "阴影", "高光", "发光", "模糊", "滤镜",
                "效果", "元素", "素材", "组件", "模块", "控件", "导航", "菜单", "卡片", "弹窗",
                "对话框", "文本框", "输入框", "搜索框", "登录", "注册", "购物车", "收藏", "点赞",
                "分享", "下载", "上传", "播放", "暂停", "停止", "前进", "后退", "返回", "关闭",
                "打开", "展开", "收起", "更多", "全部", "首页", "个人中心", "设置", "帮助", "关于",
                "联系我们", "版权", "隐私政策", "服务条款",
            ]),
            filler_words: owned(&[
                "一张", "一个", "一幅", "一种", "的", "了", "是", "在", "有", "和", "与", "或",
                "但", "而", "也", "都", "就", "才", "又", "再", "还", "很", "非常", "特别", "比较",
                "更加", "最", "更",
            ]),
            clause_separator: "，".to_string(),
            color_fragment_len: 10,
            fragment_len: 15,
            max_len: 25,
            default_name: "图层".to_string(),
        }
    }
}

fn first_hit<'k>(keywords: &'k [String], label: &str) -> Option<&'k str> {
    keywords
        .iter()
        .map(String::as_str)
        .find(|k| !k.is_empty() && label.contains(k))
}

fn take_chars(text: &str, count: usize) -> String {
    text.chars().take(count).collect()
}

impl LayerNameRules {
    /*
     * Derives the layer name for a recognised label.
     *
     * Args:
     *     label: The free-text label returned by the recognition service.
     *
     * Returns:
     *     A name of at most `max_len` characters, never empty.
     */
    pub fn derive_name(&self, label: &str) -> String {
        let label = label.trim();
        let color = first_hit(&self.color_keywords, label);
        let main_type = first_hit(&self.type_keywords, label);

        let mut clause = if self.clause_separator.is_empty() {
            label.to_string()
        } else {
            label.split(self.clause_separator.as_str()).next().unwrap_or(label).to_string()
        };
        for word in self.filler_words.iter().filter(|w| !w.is_empty()) {
            clause = clause.replace(word.as_str(), "");
        }

        let name = match (color, main_type) {
            (Some(color), Some(main_type)) => format!("{color}{main_type}"),
            (Some(color), None) => {
                // The colour word is already the prefix.
                let rest = clause.replace(color, "");
                format!("{color}{}", take_chars(rest.trim(), self.color_fragment_len))
            }
            (None, Some(_)) => take_chars(clause.trim(), self.fragment_len),
            (None, None) => String::new(),
        };
        let name = take_chars(&name, self.max_len);
        if name.trim().is_empty() {
            self.default_name.clone()
        } else {
            name
        }
    }
}

/// How a category is shown in layer and group names.
pub fn category_tag(category: &str) -> String {
    format!("【{category}】")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub node: LayerId,
    pub sequence_index: usize,
    pub label: String,
    // Derived layer name; `None` when there is no usable label.
    pub name: Option<String>,
    pub category: String,
    pub tier: Option<VisualTier>,
    pub recognition_failed: bool,
}

impl Classification {
    /*
     * The plan entry applying this result to its layer. The name derived from the
     * label becomes the new base name; layers without a usable label keep
     * `current_name`.
     */
    pub fn to_plan_entry(&self, current_name: &str) -> RenamePlanEntry {
        let base_name = match &self.name {
            Some(name) if !self.recognition_failed => name.as_str(),
            _ => current_name,
        };
        let tag = category_tag(&self.category);
        RenamePlanEntry::new(
            PlanTarget::Node(self.node),
            base_name,
            Some(&tag),
            self.tier.map(VisualTier::as_str),
        )
    }
}

#[derive(Debug, Default)]
pub struct ClassificationReport {
    pub classifications: Vec<Classification>,
    pub failures: Vec<ItemFailure<LayerId, RecognitionError>>,
}

impl ClassificationReport {
    pub fn unclassified(&self) -> usize {
        self.classifications
            .iter()
            .filter(|c| c.category == UNCLASSIFIED)
            .count()
    }
}

pub struct ClassificationPipeline<'a> {
    recognition: &'a dyn RecognitionOperations,
    rules: &'a CategoryRuleSet,
    tiers: &'a TierRules,
    names: &'a LayerNameRules,
}

impl<'a> ClassificationPipeline<'a> {
    pub fn new(
        recognition: &'a dyn RecognitionOperations,
        rules: &'a CategoryRuleSet,
        tiers: &'a TierRules,
        names: &'a LayerNameRules,
    ) -> Self {
        ClassificationPipeline {
            recognition,
            rules,
            tiers,
            names,
        }
    }

    pub fn classify_label(&self, node: LayerId, sequence_index: usize, label: &str) -> Classification {
        let category = self.rules.match_label(label).to_string();
        let tier = self.tiers.derive_tier(label, &category);
        let name = (!label.trim().is_empty()).then(|| self.names.derive_name(label));
        Classification {
            node,
            sequence_index,
            label: label.to_string(),
            name,
            category,
            tier,
            recognition_failed: false,
        }
    }

    fn failed(&self, artifact: &CaptureArtifact) -> Classification {
        Classification {
            node: artifact.node,
            sequence_index: artifact.sequence_index,
            label: FAILED_LABEL.to_string(),
            name: None,
            category: UNCLASSIFIED.to_string(),
            tier: None,
            recognition_failed: true,
        }
    }

    /*
     * Classifies every artifact in order. Only authentication errors are
     * returned; everything else is folded into the report.
     */
    pub fn run(
        &self,
        credentials: &Credentials,
        artifacts: &[CaptureArtifact],
    ) -> Result<ClassificationReport, RecognitionError> {
        let mut token = self.recognition.authenticate(credentials)?;
        let mut report = ClassificationReport::default();

        for artifact in artifacts {
            if token.is_expired() {
                log::debug!("Classifier: Access token expired, requesting a new one.");
                token = self.recognition.authenticate(credentials)?;
            }
            let classification = self.classify_one(artifact, &token, &mut report);
            log::debug!(
                "Classifier: {} '{}' -> {} ({})",
                artifact.file_name,
                classification.label,
                classification.category,
                classification.tier.map(VisualTier::as_str).unwrap_or("-")
            );
            report.classifications.push(classification);
        }

        log::info!(
            "Classifier: Classified {} artifact(s), {} unclassified, {} failed.",
            report.classifications.len(),
            report.unclassified(),
            report.failures.len()
        );
        Ok(report)
    }

    fn classify_one(
        &self,
        artifact: &CaptureArtifact,
        token: &AccessToken,
        report: &mut ClassificationReport,
    ) -> Classification {
        match self.recognition.classify(&artifact.bytes, token) {
            Ok(label) => self.classify_label(artifact.node, artifact.sequence_index, label.trim()),
            Err(e) => {
                log::warn!("Classifier: Recognition failed for {}: {e}", artifact.file_name);
                report.failures.push(ItemFailure::new(artifact.node, e));
                self.failed(artifact)
            }
        }
    }
}
