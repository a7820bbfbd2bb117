//! Interactive tool client.
//!
//! Reads commands from stdin and drives a [`RegistryToolHost`]. This stands
//! in for the chat front end: every operation it offers goes through the
//! same discovery and invocation path an agent would use.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use mcp::ToolCallResult;
use runtime::{RegistryToolHost, ToolCall, ToolHost};
use serde_json::{Value, json};
use tracing::warn;

use crate::error::Result;

/// Translated presentations are written here.
const OUTPUT_DIR: &str = "output";

const HELP: &str = "\
Commands:
  tools                          list discovered tools
  call <tool> [json-arguments]   invoke a tool, e.g. call query_weather {\"city\": \"Taipei\"}
  translate <file> <from> <to>   translate a .pptx file, e.g. translate deck.pptx English Japanese
  resources                      list server resources
  read <uri>                     print a resource, e.g. read database://schema
  help                           show this help
  quit                           exit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Tools,
    Call { tool: String, arguments: Value },
    Translate { file: PathBuf, source: String, target: String },
    Resources,
    Read { uri: String },
    Help,
    Quit,
}

/// Parse one input line. `Ok(None)` for a blank line.
pub fn parse_command(line: &str) -> std::result::Result<Option<Command>, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word {
        "" => return Ok(None),
        "tools" => Command::Tools,
        "resources" => Command::Resources,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "read" if !rest.is_empty() => Command::Read {
            uri: rest.to_string(),
        },
        "call" => {
            let (tool, json) = match rest.split_once(char::is_whitespace) {
                Some((tool, json)) => (tool, json.trim()),
                None => (rest, ""),
            };
            if tool.is_empty() {
                return Err("usage: call <tool> [json-arguments]".to_string());
            }
            let arguments = if json.is_empty() {
                json!({})
            } else {
                serde_json::from_str(json).map_err(|e| format!("invalid JSON arguments: {e}"))?
            };
            Command::Call {
                tool: tool.to_string(),
                arguments,
            }
        }
        "translate" => match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
            [file, source, target] => Command::Translate {
                file: PathBuf::from(file),
                source: source.to_string(),
                target: target.to_string(),
            },
            _ => return Err("usage: translate <file> <from> <to>".to_string()),
        },
        "read" => return Err("usage: read <uri>".to_string()),
        other => return Err(format!("unknown command '{other}'. Type 'help'")),
    };
    Ok(Some(command))
}

pub struct Client {
    host: RegistryToolHost,
    next_call: u64,
}

impl Client {
    pub fn new(host: RegistryToolHost) -> Self {
        Self { host, next_call: 1 }
    }

    /// Read-eval loop until `quit` or end of input.
    pub async fn run(&mut self) -> Result<()> {
        let servers: Vec<&str> = self.host.servers().collect();
        println!("Connected to {} ({} tools).", servers.join(", "), self.host.specs().len());
        println!("Type 'help' for commands, 'quit' or Ctrl+D to exit.\n");

        let stdin = io::stdin();
        let mut stdout = io::stdout();
        loop {
            print!("> ");
            stdout.flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }

            match parse_command(&line) {
                Ok(None) => {}
                Ok(Some(Command::Quit)) => break,
                Ok(Some(command)) => self.execute(command).await,
                Err(message) => eprintln!("{message}"),
            }
        }
        Ok(())
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Tools => self.print_tools(),
            Command::Call { tool, arguments } => self.call(&tool, arguments).await,
            Command::Translate {
                file,
                source,
                target,
            } => self.translate(&file, &source, &target).await,
            Command::Resources => self.print_resources().await,
            Command::Read { uri } => self.read(&uri).await,
            Command::Help => println!("{HELP}"),
            Command::Quit => {}
        }
    }

    fn print_tools(&self) {
        for spec in self.host.specs() {
            println!("{} ({})", spec.name, spec.server);
            println!("    {}", spec.description);
            if let Some(properties) = spec.schema["properties"].as_object() {
                let required = &spec.schema["required"];
                for (name, property) in properties {
                    let optional = if required.as_array().is_some_and(|r| r.contains(&json!(name))) {
                        ""
                    } else {
                        "?"
                    };
                    println!(
                        "    - {name}{optional}: {}",
                        property["type"].as_str().unwrap_or("any")
                    );
                }
            }
        }
    }

    async fn invoke(&mut self, tool: &str, arguments: Value) -> Option<ToolCallResult> {
        let call = ToolCall::new(format!("call-{}", self.next_call), tool, arguments);
        self.next_call += 1;
        match self.host.execute(&call).await {
            Ok(result) => Some(result),
            Err(e) => {
                eprintln!("Error: {e}");
                None
            }
        }
    }

    async fn call(&mut self, tool: &str, arguments: Value) {
        if let Some(result) = self.invoke(tool, arguments).await {
            println!("{}", render_result(&result));
        }
    }

    async fn translate(&mut self, file: &Path, source: &str, target: &str) {
        let bytes = match std::fs::read(file) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("Error: cannot read {}: {e}", file.display());
                return;
            }
        };
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let arguments = json!({
            "olang": source,
            "tlang": target,
            "file_content": STANDARD.encode(bytes),
            "file_name": file_name,
        });

        let Some(result) = self.invoke("translate_ppt", arguments).await else {
            return;
        };
        match (result.success, result.payload.as_ref()) {
            (true, Some(payload)) => match save_translation(payload) {
                Ok(path) => println!(
                    "Saved {} ({} runs translated, {} failed)",
                    path.display(),
                    payload["runs_translated"],
                    payload["runs_failed"]
                ),
                Err(e) => eprintln!("Error: {e}"),
            },
            _ => println!("{}", render_result(&result)),
        }
    }

    async fn print_resources(&self) {
        for server in self.host.servers() {
            let Some(channel) = self.host.channel(server) else {
                continue;
            };
            match channel.list_resources().await {
                Ok(resources) => {
                    for resource in resources {
                        println!("{} ({server}): {}", resource.uri, resource.name);
                    }
                }
                Err(e) => warn!(%server, error = %e, "cannot list resources"),
            }
        }
    }

    async fn read(&self, uri: &str) {
        for server in self.host.servers() {
            let Some(channel) = self.host.channel(server) else {
                continue;
            };
            let owns = channel
                .list_resources()
                .await
                .map(|resources| resources.iter().any(|r| r.uri == uri))
                .unwrap_or(false);
            if owns {
                match channel.read_resource(uri).await {
                    Ok(text) => println!("{text}"),
                    Err(e) => eprintln!("Error: {e}"),
                }
                return;
            }
        }
        eprintln!("Error: no server offers {uri}");
    }
}

/// Human-readable rendering of a tool result.
///
/// Prefers a payload's own text rendering (`summary`, `table`) and elides
/// embedded file contents.
pub fn render_result(result: &ToolCallResult) -> String {
    if !result.success {
        let kind = result.error_kind.map_or("Error", |k| k.as_str());
        return format!("{kind}: {}", result.message.as_deref().unwrap_or(""));
    }

    let Some(payload) = &result.payload else {
        return "(no payload)".to_string();
    };
    for key in ["summary", "table"] {
        if let Some(text) = payload[key].as_str() {
            return text.to_string();
        }
    }

    let mut shown = payload.clone();
    if let Some(content) = shown.get_mut("file_content") {
        let len = content.as_str().map_or(0, str::len);
        *content = Value::String(format!("<{len} base64 characters>"));
    }
    serde_json::to_string_pretty(&shown).unwrap_or_else(|_| shown.to_string())
}

fn save_translation(payload: &Value) -> std::io::Result<PathBuf> {
    let invalid = |message: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string());
    let name = payload["file_name"]
        .as_str()
        .and_then(|n| Path::new(n).file_name())
        .ok_or_else(|| invalid("result has no file name"))?;
    let content = payload["file_content"]
        .as_str()
        .ok_or_else(|| invalid("result has no file content"))?;
    let bytes = STANDARD
        .decode(content)
        .map_err(|e| invalid(&format!("result content is not base64: {e}")))?;

    std::fs::create_dir_all(OUTPUT_DIR)?;
    let path = Path::new(OUTPUT_DIR).join(name);
    std::fs::write(&path, bytes)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp::ErrorKind;

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_command("  tools "), Ok(Some(Command::Tools)));
        assert_eq!(parse_command("exit"), Ok(Some(Command::Quit)));
        assert_eq!(parse_command(""), Ok(None));
        assert_eq!(
            parse_command("read database://schema"),
            Ok(Some(Command::Read {
                uri: "database://schema".to_string()
            }))
        );
    }

    #[test]
    fn parses_call_with_json() {
        let command = parse_command(r#"call query_weather {"city": "New York"}"#).unwrap();
        assert_eq!(
            command,
            Some(Command::Call {
                tool: "query_weather".to_string(),
                arguments: json!({"city": "New York"}),
            })
        );
        assert_eq!(
            parse_command("call ping").unwrap(),
            Some(Command::Call {
                tool: "ping".to_string(),
                arguments: json!({}),
            })
        );
    }

    #[test]
    fn reports_usage_errors() {
        assert!(parse_command("call").unwrap_err().contains("usage"));
        assert!(parse_command("call x {not json").unwrap_err().contains("invalid JSON"));
        assert!(parse_command("translate deck.pptx en").unwrap_err().contains("usage"));
        assert!(parse_command("read").unwrap_err().contains("usage"));
        assert!(parse_command("dance").unwrap_err().contains("unknown command"));
    }

    #[test]
    fn renders_failures_with_kind() {
        let result = ToolCallResult::failed(ErrorKind::UnknownTool, "unknown tool: nope");
        assert_eq!(render_result(&result), "UnknownToolError: unknown tool: nope");
    }

    #[test]
    fn renders_text_payloads_and_elides_files() {
        let table = ToolCallResult::ok(json!({"table": "a\n-\n1\nTotal 1 records", "rows": []}));
        assert_eq!(render_result(&table), "a\n-\n1\nTotal 1 records");

        let file = ToolCallResult::ok(json!({"file_name": "x.pptx", "file_content": "QUJD"}));
        let rendered = render_result(&file);
        assert!(rendered.contains("<4 base64 characters>"));
        assert!(!rendered.contains("QUJD"));
    }
}
