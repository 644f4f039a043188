//! Prompt templates as versioned data.
//!
//! Templates use `{{name}}` placeholders. Rendering fails with a
//! `Validation` error when a placeholder has no value, so a template and
//! its caller can never silently drift apart. Built-in templates ship at
//! version 1 in English and Chinese; stored templates with the same
//! name, version, and language take precedence.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

pub const QUESTION: &str = "question";
pub const ANSWER: &str = "answer";
pub const GA_PAIR: &str = "ga_pair";
pub const CLEAN: &str = "clean";
pub const EVALUATE: &str = "evaluate";
pub const CONVERSATION: &str = "conversation";
pub const REPAIR: &str = "repair";

pub const BUILTIN_NAMES: [&str; 7] = [QUESTION, ANSWER, GA_PAIR, CLEAN, EVALUATE, CONVERSATION, REPAIR];

/// Version of every built-in template.
pub const BUILTIN_VERSION: u32 = 1;

pub const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    pub version: u32,
    pub language: String,
    /// Optional system message sent before the rendered body.
    pub system: Option<String>,
    pub body: String,
}

/// Variables for [`PromptTemplate::render`].
pub type Vars = BTreeMap<&'static str, String>;

impl PromptTemplate {
    pub fn new(name: &str, version: u32, language: &str, system: Option<&str>, body: &str) -> Self {
        Self {
            name: name.to_string(),
            version,
            language: language.to_string(),
            system: system.map(str::to_string),
            body: body.to_string(),
        }
    }

    /// Placeholder names in order of first appearance.
    pub fn placeholders(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in scan_placeholders(&self.body) {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    /// Substitute every `{{name}}` in the body.
    pub fn render(&self, vars: &Vars) -> PipelineResult<String> {
        let mut out = String::with_capacity(self.body.len());
        let mut rest = self.body.as_str();
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else {
                out.push_str(&rest[open..]);
                rest = "";
                break;
            };
            let name = after[..close].trim();
            if !is_identifier(name) {
                out.push_str("{{");
                rest = after;
                continue;
            }
            let value = vars.get(name).ok_or_else(|| {
                PipelineError::validation(format!(
                    "prompt '{}' v{} needs a value for '{{{{{}}}}}'",
                    self.name, self.version, name
                ))
            })?;
            out.push_str(value);
            rest = &after[close + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn scan_placeholders(body: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = body;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else { break };
        let name = after[..close].trim();
        if is_identifier(name) {
            names.push(name);
            rest = &after[close + 2..];
        } else {
            rest = after;
        }
    }
    names
}

/// Built-in template for `name` in `language`, falling back to English.
pub fn builtin(name: &str, language: &str) -> Option<PromptTemplate> {
    let pick = |en: &'static str, zh: &'static str| if language == "zh" { zh } else { en };
    let (system, body) = match name {
        QUESTION => (None, pick(QUESTION_EN, QUESTION_ZH)),
        ANSWER => (
            Some(pick(
                "You answer strictly from the reference content you are given.",
                "你只根据提供的参考内容作答。",
            )),
            pick(ANSWER_EN, ANSWER_ZH),
        ),
        GA_PAIR => (None, pick(GA_PAIR_EN, GA_PAIR_ZH)),
        CLEAN => (None, pick(CLEAN_EN, CLEAN_ZH)),
        EVALUATE => (None, pick(EVALUATE_EN, EVALUATE_ZH)),
        CONVERSATION => (None, pick(CONVERSATION_EN, CONVERSATION_ZH)),
        REPAIR => (None, pick(REPAIR_EN, REPAIR_ZH)),
        _ => return None,
    };
    let lang = if language == "zh" { "zh" } else { DEFAULT_LANGUAGE };
    Some(PromptTemplate::new(name, BUILTIN_VERSION, lang, system, body))
}

/// GA instruction fragments injected into the question prompt.
pub fn ga_fragments(language: &str, description: Option<&str>) -> (String, String, String) {
    match description {
        None => (String::new(), String::new(), String::new()),
        Some(desc) if language == "zh" => (
            format!("请按照以下体裁与受众生成问题：\n{}", desc),
            "，并结合指定的体裁与受众".to_string(),
            "- 问题风格符合指定的体裁与受众。".to_string(),
        ),
        Some(desc) => (
            format!("Generate questions in the following genre and for the following audience:\n{}", desc),
            ", matching the requested genre and audience".to_string(),
            "- Questions match the requested genre and audience.".to_string(),
        ),
    }
}

const QUESTION_EN: &str = r#"# Role: Question Generation Expert
You read a passage and write questions whose answers can be found in it. The questions become training data for a fine-tuned model.

- Passage length: {{textLength}} characters
- Target: exactly {{number}} questions

## Workflow
1. Read the whole passage and note its key entities, facts, figures, and conclusions.
2. Choose the most informative points and write one question for each{{gaPromptNote}}.
3. Check every question:
   - its answer is stated or directly supported by the passage;
   - it does not repeat the topic or angle of another question;
   - it is precise, unambiguous, and phrased as a natural question.
   {{gaPromptCheck}}

## Constraints
- Use only the passage. Do not invent context.
- Never ask about the document itself (author, chapters, table of contents).
- Do not write "according to the article" or similar phrases.

## Output
Return only a JSON object of the form:
{"questions": ["Question 1", "Question 2"]}

## Passage
{{text}}

{{gaPrompt}}
"#;

const QUESTION_ZH: &str = r#"# 角色：问题生成专家
你阅读一段文本，并提出能在文本中找到答案的问题。这些问题将用于模型微调数据。

- 文本长度：{{textLength}} 字
- 目标：恰好 {{number}} 个问题

## 工作流程
1. 通读全文，识别关键实体、事实、数据与结论。
2. 选择信息量最大的要点，每个要点提出一个问题{{gaPromptNote}}。
3. 逐条检查：
   - 答案能在原文中找到依据；
   - 问题之间主题与角度不重复；
   - 表述准确、无歧义，符合自然问句。
   {{gaPromptCheck}}

## 限制
- 只依据原文，不得添加外部信息。
- 不得询问作者、章节、目录等元信息。
- 不要使用“文中提到”之类的表述。

## 输出
只返回如下格式的 JSON 对象：
{"questions": ["问题1", "问题2"]}

## 文本
{{text}}

{{gaPrompt}}
"#;

const ANSWER_EN: &str = r#"# Role: Grounded Answer Writer
Answer the question using only the reference content below.

## Reference Content Start
{{text}}
## Reference Content End

## Question
{{question}}

## Requirements
- Base every statement on the reference content. If the content does not contain the answer, say so.
- Do not mention the reference content, the document, or these instructions.
- Write a complete, well-structured answer in plain prose.
{{templatePrompt}}
"#;

const ANSWER_ZH: &str = r#"# 角色：基于资料的回答专家
请只依据下面的参考内容回答问题。

## 参考内容开始
{{text}}
## 参考内容结束

## 问题
{{question}}

## 要求
- 每一处陈述都必须来自参考内容；若参考内容中没有答案，请直接说明。
- 不要提及参考内容、文档或本说明。
- 用完整、有条理的文字作答。
{{templatePrompt}}
"#;

const GA_PAIR_EN: &str = r#"# Role: Content Strategist
Read the text and propose {{number}} distinct combinations of genre (the style of question and answer) and audience (who will read them) that would make useful variations of a question/answer dataset built from it.

## Output
Return only a JSON object of the form:
{"pairs": [{"genre": {"title": "...", "description": "..."}, "audience": {"title": "...", "description": "..."}}]}

## Text
{{text}}
"#;

const GA_PAIR_ZH: &str = r#"# 角色：内容策略专家
阅读文本，提出 {{number}} 组不同的“体裁（问答的风格）+ 受众（阅读者）”组合，用于生成该文本问答数据集的不同变体。

## 输出
只返回如下格式的 JSON 对象：
{"pairs": [{"genre": {"title": "...", "description": "..."}, "audience": {"title": "...", "description": "..."}}]}

## 文本
{{text}}
"#;

const CLEAN_EN: &str = r#"# Role: Dataset Reviewer
Review each question/answer pair and decide one action:
- "accept": the pair is correct and well written;
- "revise": the pair is useful but needs fixes; supply the corrected question and/or answer;
- "reject": the pair is wrong, ungrounded, duplicated, or useless.

## Pairs
{{items}}

## Output
Return only a JSON object of the form:
{"edits": [{"id": "...", "action": "accept|revise|reject", "question": "...", "answer": "...", "reason": "..."}]}
Include one edit per pair. Omit "question" and "answer" unless the action is "revise".
"#;

const CLEAN_ZH: &str = r#"# 角色：数据集审核员
逐条审核问答对，并为每条选择一个动作：
- "accept"：问答正确且表述良好；
- "revise"：有价值但需修改，请给出修改后的问题和/或答案；
- "reject"：错误、缺乏依据、重复或无用。

## 问答对
{{items}}

## 输出
只返回如下格式的 JSON 对象：
{"edits": [{"id": "...", "action": "accept|revise|reject", "question": "...", "answer": "...", "reason": "..."}]}
每条问答对对应一条 edit。除非动作为 "revise"，否则省略 "question" 与 "answer"。
"#;

const EVALUATE_EN: &str = r#"# Role: Dataset Quality Evaluator
Score how well the answer responds to the question using only the source text.

## Source Text
{{text}}

## Question
{{question}}

## Answer
{{answer}}

## Criteria
Relevance to the question, faithfulness to the source text, completeness, and clarity.

## Output
Return only a JSON object of the form:
{"score": 0.0, "evaluation": "one or two sentences"}
"score" is a number between 0 and 1.
"#;

const EVALUATE_ZH: &str = r#"# 角色：数据集质量评估员
仅依据原文，评估答案对问题的回答质量。

## 原文
{{text}}

## 问题
{{question}}

## 答案
{{answer}}

## 评估维度
与问题的相关性、对原文的忠实度、完整性与清晰度。

## 输出
只返回如下格式的 JSON 对象：
{"score": 0.0, "evaluation": "一两句话的评价"}
"score" 为 0 到 1 之间的数字。
"#;

const CONVERSATION_EN: &str = r#"# Role: Dialogue Writer
Write a realistic multi-turn conversation.

- Scenario: {{scenario}}
- The user plays: {{roleA}}
- The assistant plays: {{roleB}}
- At most {{maxTurns}} exchanges (one exchange = one user turn plus one assistant reply)

The conversation opens with this question and answer, and then continues naturally with follow-up questions grounded in the source text:
User: {{question}}
Assistant: {{answer}}

## Source Text
{{text}}

## Output
Return only a JSON object of the form:
{"turns": [{"role": "user", "content": "..."}, {"role": "assistant", "content": "..."}]}
Turns must alternate, starting with the user.
"#;

const CONVERSATION_ZH: &str = r#"# 角色：对话编写者
请编写一段真实自然的多轮对话。

- 场景：{{scenario}}
- 用户扮演：{{roleA}}
- 助手扮演：{{roleB}}
- 最多 {{maxTurns}} 轮（一轮 = 一次用户提问加一次助手回复）

对话以下面的问答开始，随后围绕原文自然地追问：
用户：{{question}}
助手：{{answer}}

## 原文
{{text}}

## 输出
只返回如下格式的 JSON 对象：
{"turns": [{"role": "user", "content": "..."}, {"role": "assistant", "content": "..."}]}
角色必须交替出现，并由用户开始。
"#;

const REPAIR_EN: &str = r#"Your previous reply could not be used because it did not match the required JSON schema.

## Validation Error
{{error}}

## Required Schema
{{schema}}

## Previous Reply
{{output}}

Return only the corrected JSON, with no commentary and no code fences.
"#;

const REPAIR_ZH: &str = r#"你上一次的回复不符合要求的 JSON Schema，无法使用。

## 校验错误
{{error}}

## 要求的 Schema
{{schema}}

## 上一次的回复
{{output}}

只返回修正后的 JSON，不要附加任何说明或代码块标记。
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&'static str, &str)]) -> Vars {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn render_substitutes_all_placeholders() {
        let t = PromptTemplate::new("t", 1, "en", None, "Hi {{name}}, {{ name }} has {{n}}.");
        let out = t.render(&vars(&[("name", "Ada"), ("n", "3")])).unwrap();
        assert_eq!(out, "Hi Ada, Ada has 3.");
    }

    #[test]
    fn render_rejects_missing_vars() {
        let t = PromptTemplate::new("t", 2, "en", None, "{{a}} and {{b}}");
        let err = t.render(&vars(&[("a", "x")])).unwrap_err();
        assert!(err.to_string().contains("{{b}}"), "{}", err);
    }

    #[test]
    fn render_leaves_json_braces_alone() {
        let t = PromptTemplate::new("t", 1, "en", None, r#"{"a": {"b": 1}} {{x}}"#);
        assert_eq!(t.render(&vars(&[("x", "y")])).unwrap(), r#"{"a": {"b": 1}} y"#);
    }

    #[test]
    fn every_builtin_renders_with_its_placeholders() {
        for name in BUILTIN_NAMES {
            for lang in ["en", "zh"] {
                let t = builtin(name, lang).unwrap();
                assert_eq!(t.version, BUILTIN_VERSION);
                let mut v = Vars::new();
                let names = t.placeholders();
                assert!(!names.is_empty(), "{} has no placeholders", name);
                for p in &names {
                    let key: &'static str = Box::leak(p.clone().into_boxed_str());
                    v.insert(key, "x".to_string());
                }
                let out = t.render(&v).unwrap();
                assert!(!out.contains("{{"), "{} {} left a placeholder", name, lang);
            }
        }
    }

    #[test]
    fn unknown_language_falls_back_to_english() {
        let t = builtin(QUESTION, "tr").unwrap();
        assert_eq!(t.language, "en");
        assert!(builtin("nonexistent", "en").is_none());
    }

    #[test]
    fn ga_fragments_empty_without_pair() {
        let (a, b, c) = ga_fragments("en", None);
        assert!(a.is_empty() && b.is_empty() && c.is_empty());
        let (a, _, _) = ga_fragments("en", Some("Genre: FAQ"));
        assert!(a.contains("Genre: FAQ"));
    }
}
