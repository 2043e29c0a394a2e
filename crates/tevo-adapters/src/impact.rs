//! Keyword-tier impact scoring and conversion of drafts into insight rows.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tevo_core::{InsightDraft, NewInsight};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactTier {
    pub score: u8,
    pub keywords: Vec<String>,
}

/// Tiers are checked in order; the first tier with a matching keyword wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactRules {
    pub tiers: Vec<ImpactTier>,
    #[serde(default = "default_unmatched_score")]
    pub unmatched_score: u8,
}

fn default_unmatched_score() -> u8 {
    2
}

impl Default for ImpactRules {
    fn default() -> Self {
        let tier = |score: u8, keywords: &[&str]| ImpactTier {
            score,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        };
        Self {
            tiers: vec![
                tier(
                    5,
                    &[
                        "viral",
                        "breakthrough",
                        "sota",
                        "game changer",
                        "爆火",
                        "刷屏",
                        "现象级",
                        "颠覆",
                        "破圈",
                        "彻底改变",
                        "最强",
                    ],
                ),
                tier(
                    4,
                    &["发布", "上线", "重磅", "重大更新", "显著提升", "大幅提升", "hot"],
                ),
                tier(3, &["开源", "新增", "更新", "增强", "优化", "支持", "推出"]),
            ],
            unmatched_score: default_unmatched_score(),
        }
    }
}

impl ImpactRules {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let rules: ImpactRules = serde_yaml::from_str(yaml).context("parsing impact rules")?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("reading impact rules {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let scores = self
            .tiers
            .iter()
            .map(|tier| tier.score)
            .chain(std::iter::once(self.unmatched_score));
        for score in scores {
            if !(1..=5).contains(&score) {
                bail!("impact score {score} outside 1..=5");
            }
        }
        Ok(())
    }

    /// Score 1-5 from the impact signal and evolution tag. Both blank scores 1.
    pub fn score(&self, impact_signal: Option<&str>, evolution_tag: Option<&str>) -> u8 {
        let combined = format!(
            "{} {}",
            impact_signal.unwrap_or_default(),
            evolution_tag.unwrap_or_default()
        );
        let combined = combined.trim();
        if combined.is_empty() {
            return 1;
        }
        let haystack = combined.to_lowercase();
        self.tiers
            .iter()
            .find(|tier| {
                tier.keywords
                    .iter()
                    .any(|keyword| haystack.contains(&keyword.to_lowercase()))
            })
            .map(|tier| tier.score)
            .unwrap_or(self.unmatched_score)
    }
}

pub trait InsightDraftExt {
    fn to_row(&self, source_id: &str, rules: &ImpactRules) -> NewInsight;
}

impl InsightDraftExt for InsightDraft {
    fn to_row(&self, source_id: &str, rules: &ImpactRules) -> NewInsight {
        NewInsight {
            source_id: source_id.to_string(),
            dimension: self.dimension,
            project_name: self.project_name.clone(),
            tech_node: self.tech_node.clone(),
            evolution_tag: self.evolution_tag.clone(),
            impact_score: rules.score(self.impact_signal.as_deref(), self.evolution_tag.as_deref()),
            summary: self
                .raw_context
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

pub fn to_rows(source_id: &str, drafts: &[InsightDraft], rules: &ImpactRules) -> Vec<NewInsight> {
    drafts
        .iter()
        .map(|draft| draft.to_row(source_id, rules))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tevo_core::Dimension;

    #[test]
    fn builtin_tiers_follow_keyword_priority() {
        let rules = ImpactRules::default();
        assert_eq!(rules.score(Some("全网爆火"), None), 5);
        assert_eq!(rules.score(Some("A Game Changer for agents"), None), 5);
        assert_eq!(rules.score(None, Some("SOTA")), 5);
        assert_eq!(rules.score(Some("正式发布"), Some("开源")), 4);
        assert_eq!(rules.score(None, Some("开源")), 3);
        assert_eq!(rules.score(Some("some chatter"), Some("商业落地")), 2);
        assert_eq!(rules.score(Some("  "), None), 1);
        assert_eq!(rules.score(None, None), 1);
    }

    #[test]
    fn yaml_override_replaces_tiers() {
        let rules = ImpactRules::from_yaml_str(
            "tiers:\n  - score: 4\n    keywords: [\"launch\"]\nunmatched_score: 3\n",
        )
        .expect("rules");
        assert_eq!(rules.score(Some("Big LAUNCH"), None), 4);
        assert_eq!(rules.score(Some("爆火"), None), 3);

        assert!(ImpactRules::from_yaml_str("tiers:\n  - score: 9\n    keywords: [x]\n").is_err());
    }

    #[test]
    fn rules_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("impact.yaml");
        fs::write(&path, "tiers:\n  - score: 5\n    keywords: [\"agent\"]\n").unwrap();
        let rules = ImpactRules::load(&path).unwrap();
        assert_eq!(rules.unmatched_score, 2);
        assert_eq!(rules.score(Some("agentic"), None), 5);
    }

    #[test]
    fn rows_carry_scores_and_trimmed_summaries() {
        let draft = InsightDraft {
            dimension: Dimension::AiCoding,
            project_name: Some("Cursor".into()),
            tech_node: "from autocomplete to full page generation".into(),
            evolution_tag: Some("VibeCoding".into()),
            impact_signal: Some("彻底改变产品开发流程".into()),
            raw_context: Some("  summary text \n".into()),
        };
        let bare = InsightDraft {
            dimension: Dimension::Llm,
            project_name: None,
            tech_node: "x".into(),
            evolution_tag: None,
            impact_signal: None,
            raw_context: None,
        };
        let rows = to_rows("src-1", &[draft, bare], &ImpactRules::default());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].source_id, "src-1");
        assert_eq!(rows[0].impact_score, 5);
        assert_eq!(rows[0].summary, "summary text");
        assert_eq!(rows[1].impact_score, 1);
        assert_eq!(rows[1].summary, "");
    }
}
