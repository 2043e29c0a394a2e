//! Insight extraction over an OpenAI-compatible chat-completions endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tevo_core::{Dimension, InsightDraft};
use tevo_storage::{truncate_chars, BackoffPolicy, HttpClientConfig, HttpFetcher};
use tracing::debug;

use crate::recovery::{parse_insight_items, recover_json};
use crate::{ExtractError, InsightExtractor};

pub const SYSTEM_PROMPT: &str = "你是一个严格按要求输出 JSON 的信息抽取助手。";

#[derive(Debug, Clone)]
pub struct ChatExtractorConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub http: HttpClientConfig,
}

impl ChatExtractorConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o".into(),
            http: HttpClientConfig {
                backoff: BackoffPolicy {
                    max_retries: 2,
                    base_delay: Duration::from_millis(800),
                    max_delay: Duration::from_secs(10),
                },
                ..HttpClientConfig::default()
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// One instance per worker; the HTTP session is not shared.
#[derive(Debug)]
pub struct ChatInsightExtractor {
    config: ChatExtractorConfig,
    http: HttpFetcher,
}

impl ChatInsightExtractor {
    pub fn new(mut config: ChatExtractorConfig) -> Result<Self, ExtractError> {
        config.api_key = config.api_key.trim().to_string();
        if config.api_key.is_empty() {
            return Err(ExtractError::Config("missing OpenAI API key".into()));
        }
        let http = HttpFetcher::new(config.http.clone())
            .map_err(|err| ExtractError::Config(format!("{err:#}")))?;
        Ok(Self { config, http })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn complete(&self, prompt: &str) -> Result<String, ExtractError> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };
        let body = serde_json::to_value(&request).map_err(|err| ExtractError::Unparseable {
            reason: format!("encoding request: {err}"),
            excerpt: String::new(),
        })?;

        let response = self
            .http
            .post_json(&self.completions_url(), Some(&self.config.api_key), &body)
            .await?;

        let parsed: ChatCompletionResponse =
            serde_json::from_slice(&response.body).map_err(|err| ExtractError::Unparseable {
                reason: format!("completion response: {err}"),
                excerpt: truncate_chars(&response.text(), 500),
            })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| ExtractError::EmptyCompletion(truncate_chars(&response.text(), 500)))
    }
}

#[async_trait]
impl InsightExtractor for ChatInsightExtractor {
    async fn extract(
        &self,
        title: Option<&str>,
        text: &str,
    ) -> Result<Vec<InsightDraft>, ExtractError> {
        let prompt = build_prompt(title, text);
        let completion = self.complete(&prompt).await?;
        let (strategy, value) = recover_json(&completion)?;
        debug!(strategy = strategy.name(), "recovered model output");
        parse_insight_items(value)
    }
}

/// User prompt: role, classification strategy, dimension definitions, output schema, input.
pub fn build_prompt(title: Option<&str>, content_text: &str) -> String {
    let mut prompt = String::from(
        "# Role\n\
         你是一位 AI 行业进化史记录专家，擅长从碎片化的快讯中捕捉技术的“进化节点”。\n\n\
         # Task\n\
         分析输入的新闻/快讯，提炼技术进展。即使信息模糊，也要根据功能描述推断其所属的最相关维度。\n\n\
         # Strategy\n\
         1. 多重归类：如果一个项目同时涉及多个维度，请在每个维度下各记录一条。\n\
         2. 捕捉 Vibe Coding 信号：关注“动动嘴”、“不会代码也能做”、“全自动生成页面”等描述，归入 AI编程/Vibe Coding。\n\
         3. 推断缺失信息：未提及机构时记录为“开源/个人项目”。\n\n\
         # Dimensions Definition\n",
    );
    for dimension in Dimension::ALL {
        prompt.push_str(&format!(
            "- {}: {}\n",
            dimension.native_label(),
            dimension_definition(dimension)
        ));
    }
    prompt.push_str(
        "\n# Output Format (JSON ONLY)\n\
         [\n  {\n\
         \x20   \"dimension\": \"维度名称\",\n\
         \x20   \"project_name\": \"项目/产品名\",\n\
         \x20   \"tech_node\": \"核心技术点（描述进化脉络，例如：从代码补全到UI全自动生成）\",\n\
         \x20   \"evolution_tag\": \"标签（如：开源 / 突破性体验 / 商业落地 / VibeCoding）\",\n\
         \x20   \"impact_signal\": \"文中提到的热度信息（如：爆火、彻底改变产品开发流程等）\",\n\
         \x20   \"raw_context\": \"简短原始摘要\"\n\
         \x20 }\n]\n\n\
         要求：只输出 JSON 数组，不要输出任何额外文字。\n",
    );
    prompt.push_str(&format!("输入标题：{}\n", title.unwrap_or_default().trim()));
    prompt.push_str(&format!("输入正文：{}\n", content_text.trim()));
    prompt
}

fn dimension_definition(dimension: Dimension) -> &'static str {
    match dimension {
        Dimension::Llm => "文本、代码逻辑、长文本理解、模型架构。",
        Dimension::Vlm => "视觉理解、OCR、4D/3D感知、物体分割。",
        Dimension::VideoGeneration => "视频模型、数字人、特效、3D重建。",
        Dimension::Audio => "声音克隆、转录、实时对话、情感语音。",
        Dimension::EmbodiedAi => "机器人、自动操作电脑(Desktop Agent)、自动驾驶、物理交互。",
        Dimension::AiCoding => "自然语言编程、全自动代码生成、Figma2Code、自进化编程助手。",
        Dimension::AiApplications => "除去编程外的垂直行业工具（如：教育、表格、医疗助手）。",
    }
}
