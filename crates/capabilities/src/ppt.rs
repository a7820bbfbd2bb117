//! PowerPoint translation.
//!
//! A `.pptx` file is a zip archive; slide text lives in `<a:t>` runs inside
//! `ppt/slides/slideN.xml`. Only the run contents are replaced, so fonts,
//! colours and layout stay exactly as they were. Every other archive entry
//! is copied through unchanged.

use std::collections::HashMap;
use std::future::Future;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use mcp::{
    ArgKind, ArgumentSchema, Arguments, PeerInfo, ResourceDescriptor, ToolDefinition, ToolFailure,
    ToolService,
};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::{CapabilityError, Result};

pub const INSTRUCTIONS_URI: &str = "translator://instructions";
pub const DEFAULT_FILE_NAME: &str = "uploaded_presentation.pptx";
pub const DEFAULT_MAX_FILE_BYTES: usize = 10 * 1024 * 1024;
/// Total uncompressed size of all archive entries.
pub const DEFAULT_MAX_EXPANDED_BYTES: usize = 20 * DEFAULT_MAX_FILE_BYTES;
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

const INSTRUCTIONS: &str = "\
translate_ppt translates every text run of a PowerPoint (.pptx) file.

Arguments:
  olang         source language, e.g. English
  tlang         target language, e.g. Japanese
  file_content  the .pptx file, base64 encoded
  file_name     optional original file name

The result carries file_name (translated_<name>) and file_content (the
translated .pptx, base64 encoded). Formatting is preserved. Runs that fail
to translate keep their original text and are counted in runs_failed.";

/// Text translation backend.
pub trait Translator: Send + Sync + 'static {
    fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> impl Future<Output = Result<String>> + Send;
}

#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    /// OpenAI-compatible API root (without `/chat/completions`).
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Chat-completions translator.
pub struct OpenAiTranslator {
    client: reqwest::Client,
    config: TranslatorConfig,
}

impl OpenAiTranslator {
    pub fn new(config: TranslatorConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn system_prompt(source: &str, target: &str) -> String {
        format!(
            "You are a professional translator. Translate the following text from {source} to {target}.\n\
             Keep formatting symbols, special characters, whitespace, line breaks, numbers and dates unchanged.\n\
             Keep proper nouns unless they have a standard translation.\n\
             Only translate the text. Do not add explanations or notes."
        )
    }
}

impl Translator for OpenAiTranslator {
    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String> {
        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            CapabilityError::Unavailable("translation API key is not configured".to_string())
        })?;

        let url = format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'));
        let body = json!({
            "model": self.config.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": Self::system_prompt(source, target)},
                {"role": "user", "content": text},
            ],
        });

        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CapabilityError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let data: Value = response.json().await?;
        data["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| CapabilityError::Translation("response has no message content".to_string()))
    }
}

/// Outcome of translating one presentation.
#[derive(Debug, Clone)]
pub struct TranslatedDeck {
    pub file_name: String,
    pub content: Vec<u8>,
    pub slides: usize,
    pub runs_translated: usize,
    pub runs_failed: usize,
}

/// Tool service exposing `translate_ppt`.
pub struct PptServer<T> {
    translator: T,
    max_file_bytes: usize,
    max_expanded_bytes: usize,
}

impl<T: Translator> PptServer<T> {
    pub fn new(translator: T) -> Self {
        Self {
            translator,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_expanded_bytes: DEFAULT_MAX_EXPANDED_BYTES,
        }
    }

    pub fn with_max_file_bytes(mut self, max_file_bytes: usize) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }

    /// Cap on the decompressed size of the archive.
    pub fn with_max_expanded_bytes(mut self, max_expanded_bytes: usize) -> Self {
        self.max_expanded_bytes = max_expanded_bytes;
        self
    }

    /// Translate a presentation given as raw bytes.
    pub async fn translate_deck(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        source: &str,
        target: &str,
    ) -> Result<TranslatedDeck> {
        if bytes.len() > self.max_file_bytes {
            return Err(CapabilityError::InvalidInput(format!(
                "file is {} bytes, limit is {} bytes",
                bytes.len(),
                self.max_file_bytes
            )));
        }

        let budget = self.max_expanded_bytes;
        let deck = tokio::task::spawn_blocking(move || Deck::read(&bytes, budget)).await??;
        let texts = deck.unique_texts();
        debug!(slides = deck.slide_count(), runs = texts.len(), "presentation parsed");

        let mut translations = HashMap::with_capacity(texts.len());
        let mut failed = 0;
        for text in texts {
            match self.translator.translate(&text, source, target).await {
                Ok(translated) if !translated.is_empty() => {
                    translations.insert(text, translated);
                }
                Ok(_) => failed += 1,
                Err(e) => {
                    warn!(error = %e, "run translation failed, keeping original text");
                    failed += 1;
                }
            }
        }

        let slides = deck.slide_count();
        let (content, runs) = tokio::task::spawn_blocking(move || deck.write(&translations)).await??;
        info!(
            slides,
            runs_translated = runs.replaced,
            runs_failed = runs.kept,
            texts_failed = failed,
            "presentation translated"
        );

        Ok(TranslatedDeck {
            file_name: format!("translated_{}", normalize_file_name(Some(file_name))),
            content,
            slides,
            runs_translated: runs.replaced,
            runs_failed: runs.kept,
        })
    }
}

impl<T: Translator> ToolService for PptServer<T> {
    fn info(&self) -> PeerInfo {
        PeerInfo {
            name: "ppt-translate".to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "translate_ppt",
            description: "Translate the text of a PowerPoint (.pptx) file while keeping its \
                          formatting. Returns the translated file base64 encoded.",
            schema: ArgumentSchema::new()
                .required("olang", ArgKind::String, "Source language, e.g. English")
                .required("tlang", ArgKind::String, "Target language, e.g. Japanese")
                .required("file_content", ArgKind::String, "The .pptx file, base64 encoded")
                .optional("file_name", ArgKind::String, "Original file name"),
        }]
    }

    async fn call(&self, _tool: &str, arguments: Arguments) -> std::result::Result<Value, ToolFailure> {
        let source = arguments.str("olang").unwrap_or_default().trim();
        let target = arguments.str("tlang").unwrap_or_default().trim();
        if source.is_empty() || target.is_empty() {
            return Err(ToolFailure::invalid_arguments("olang and tlang must not be empty"));
        }

        let encoded = arguments.str("file_content").unwrap_or_default();
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ToolFailure::invalid_arguments(format!("file_content is not valid base64: {e}")))?;
        let file_name = normalize_file_name(arguments.str("file_name"));

        let deck = self.translate_deck(bytes, &file_name, source, target).await?;
        Ok(json!({
            "file_name": deck.file_name,
            "file_content": STANDARD.encode(&deck.content),
            "slides": deck.slides,
            "runs_translated": deck.runs_translated,
            "runs_failed": deck.runs_failed,
        }))
    }

    fn resources(&self) -> Vec<ResourceDescriptor> {
        vec![ResourceDescriptor {
            uri: INSTRUCTIONS_URI.to_string(),
            name: "Translator instructions".to_string(),
            description: Some("How to call translate_ppt".to_string()),
            mime_type: Some("text/plain".to_string()),
        }]
    }

    async fn read_resource(&self, uri: &str) -> std::result::Result<String, ToolFailure> {
        match uri {
            INSTRUCTIONS_URI => Ok(INSTRUCTIONS.to_string()),
            other => Err(ToolFailure::invalid_arguments(format!("unknown resource: {other}"))),
        }
    }
}

/// Base name only, defaulted, with a `.pptx` extension.
fn normalize_file_name(name: Option<&str>) -> String {
    let base = name
        .map(str::trim)
        .and_then(|n| Path::new(n).file_name())
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_FILE_NAME);

    if base.to_ascii_lowercase().ends_with(".pptx") {
        base.to_string()
    } else {
        format!("{base}.pptx")
    }
}

struct Entry {
    name: String,
    data: Vec<u8>,
    compression: CompressionMethod,
    is_dir: bool,
}

/// An opened presentation archive.
struct Deck {
    entries: Vec<Entry>,
}

impl Deck {
    /// Read every entry, failing once their total size exceeds `budget`.
    ///
    /// Declared sizes are only used to fail early; the read itself is
    /// bounded, so a header that understates its entry cannot get past.
    fn read(bytes: &[u8], budget: usize) -> Result<Self> {
        let too_large = || CapabilityError::Presentation(format!("archive expands beyond {budget} bytes"));

        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut entries = Vec::with_capacity(archive.len());
        let mut remaining = budget;
        for index in 0..archive.len() {
            let mut file = archive.by_index(index)?;
            if file.size() > remaining as u64 {
                return Err(too_large());
            }

            let mut data = Vec::new();
            (&mut file).take(remaining as u64 + 1).read_to_end(&mut data)?;
            remaining = remaining.checked_sub(data.len()).ok_or_else(too_large)?;
            entries.push(Entry {
                name: file.name().to_string(),
                data,
                compression: file.compression(),
                is_dir: file.is_dir(),
            });
        }

        if !entries.iter().any(|e| e.name == "ppt/presentation.xml") {
            return Err(CapabilityError::Presentation(
                "ppt/presentation.xml is missing; not a PowerPoint file".to_string(),
            ));
        }
        Ok(Self { entries })
    }

    fn slides(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|e| is_slide(&e.name))
    }

    fn slide_count(&self) -> usize {
        self.slides().count()
    }

    /// Distinct non-blank run texts, in order of first appearance.
    fn unique_texts(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for slide in self.slides() {
            let xml = String::from_utf8_lossy(&slide.data);
            for text in run_texts(&xml) {
                if !text.trim().is_empty() && !seen.contains(&text) {
                    seen.push(text);
                }
            }
        }
        seen
    }

    fn write(self, translations: &HashMap<String, String>) -> Result<(Vec<u8>, RunCount)> {
        let mut runs = RunCount::default();
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for entry in self.entries {
            let method = match entry.compression {
                CompressionMethod::Stored => CompressionMethod::Stored,
                _ => CompressionMethod::Deflated,
            };
            let options = SimpleFileOptions::default().compression_method(method);

            if entry.is_dir {
                writer.add_directory(entry.name, options)?;
                continue;
            }

            let data = if is_slide(&entry.name) {
                let xml = std::str::from_utf8(&entry.data).map_err(|e| {
                    CapabilityError::Presentation(format!("{} is not UTF-8: {e}", entry.name))
                })?;
                replace_runs(xml, translations, &mut runs).into_bytes()
            } else {
                entry.data
            };
            writer.start_file(entry.name, options)?;
            writer.write_all(&data)?;
        }
        Ok((writer.finish()?.into_inner(), runs))
    }
}

/// Non-blank runs that were rewritten or left as they were.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RunCount {
    replaced: usize,
    kept: usize,
}

fn is_slide(name: &str) -> bool {
    name.strip_prefix("ppt/slides/slide")
        .and_then(|rest| rest.strip_suffix(".xml"))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Byte ranges of the contents of every `<a:t>` element.
fn run_spans(xml: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut pos = 0;
    while let Some(found) = xml[pos..].find("<a:t") {
        let tag_start = pos + found;
        let after_name = tag_start + "<a:t".len();
        pos = after_name;

        // `<a:tab/>`, `<a:tbl>` and friends share the prefix.
        match xml[after_name..].chars().next() {
            Some('>') | Some(' ') => {}
            _ => continue,
        }
        let Some(tag_end) = xml[after_name..].find('>').map(|i| after_name + i) else {
            break;
        };
        if xml[..tag_end].ends_with('/') {
            pos = tag_end + 1;
            continue;
        }
        let content_start = tag_end + 1;
        let Some(close) = xml[content_start..].find("</a:t>") else {
            break;
        };
        let content_end = content_start + close;
        spans.push((content_start, content_end));
        pos = content_end + "</a:t>".len();
    }
    spans
}

fn run_texts(xml: &str) -> Vec<String> {
    run_spans(xml)
        .into_iter()
        .map(|(start, end)| unescape(&xml[start..end]))
        .collect()
}

fn replace_runs(xml: &str, translations: &HashMap<String, String>, runs: &mut RunCount) -> String {
    let mut out = String::with_capacity(xml.len());
    let mut last = 0;
    for (start, end) in run_spans(xml) {
        out.push_str(&xml[last..start]);
        let original = &xml[start..end];
        let text = unescape(original);
        match translations.get(&text) {
            Some(translated) => {
                out.push_str(&escape(translated));
                runs.replaced += 1;
            }
            None => {
                out.push_str(original);
                if !text.trim().is_empty() {
                    runs.kept += 1;
                }
            }
        }
        last = end;
    }
    out.push_str(&xml[last..]);
    out
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').and_then(|semi| {
            let entity = &rest[1..semi];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .map(|hex| u32::from_str_radix(hex, 16).ok())
                    .unwrap_or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32),
            };
            c.map(|c| (c, semi))
        });
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
