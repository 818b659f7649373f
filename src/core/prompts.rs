// 提示词语料：按输入 token 数读取 ShareGPT 切分文件。
use crate::core::error::ProfilerError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PROMPT_DIR: &str = "data/ShareGPT_V3_unfiltered_cleaned_split";
pub const PROMPT_PREFIX: &str =
    "Please provide a comprehensive and detailed response based on the following information: ";

#[derive(Debug, Clone, Deserialize)]
pub struct PromptEntry {
    pub prompt: String,
    #[serde(default)]
    pub tokens: u32,
}

pub fn corpus_path(dir: &str, input_tokens: u32) -> PathBuf {
    Path::new(dir).join(format!("input_tokens_{input_tokens}.json"))
}

pub fn load_entries(path: &Path) -> Result<Vec<PromptEntry>, ProfilerError> {
    let content = fs::read_to_string(path).map_err(|err| {
        ProfilerError::prompt_corpus(format!("read {} failed: {err}", path.display()))
    })?;
    let mut entries: Vec<PromptEntry> = serde_json::from_str(&content).map_err(|err| {
        ProfilerError::prompt_corpus(format!("parse {} failed: {err}", path.display()))
    })?;
    for entry in &mut entries {
        entry.prompt = format!("{PROMPT_PREFIX}{}", entry.prompt);
    }
    Ok(entries)
}

/// Loads the prompt pool used by the ramp. An empty corpus is an error.
pub fn load_prompts(path: &Path) -> Result<Vec<String>, ProfilerError> {
    let prompts = load_entries(path)?
        .into_iter()
        .map(|entry| entry.prompt)
        .collect::<Vec<_>>();
    if prompts.is_empty() {
        return Err(ProfilerError::prompt_corpus(format!(
            "{} contains no prompts",
            path.display()
        )));
    }
    Ok(prompts)
}
