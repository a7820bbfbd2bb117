//! Static descriptions of the tool servers a session can launch.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// The external capability a tool server wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Weather,
    Sql,
    PptTranslate,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Weather, Capability::Sql, Capability::PptTranslate];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Weather => "weather",
            Capability::Sql => "sql",
            Capability::PptTranslate => "ppt-translate",
        }
    }

    /// Port the built-in server for this capability prefers.
    pub fn default_port(self) -> u16 {
        BUILTIN
            .iter()
            .find(|(_, capability, _)| *capability == self)
            .map_or(0, |&(_, _, port)| port)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown capability: {s}"))
    }
}

/// Program and leading arguments used to launch a server.
///
/// The supervisor appends `--port <n>` when spawning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl EntryPoint {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// One launchable tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolServerSpec {
    pub name: String,
    pub entry: EntryPoint,
    pub default_port: u16,
    pub capability: Capability,
}

impl ToolServerSpec {
    pub fn new(
        name: impl Into<String>,
        capability: Capability,
        default_port: u16,
        entry: EntryPoint,
    ) -> Self {
        Self {
            name: name.into(),
            entry,
            default_port,
            capability,
        }
    }

    /// The three built-in servers, launched as `<program> <prefix..> serve <capability>`.
    pub fn builtin(program: impl Into<PathBuf>, prefix_args: &[String]) -> Vec<ToolServerSpec> {
        let program = program.into();
        BUILTIN
            .iter()
            .map(|&(name, capability, port)| {
                let mut entry = EntryPoint::new(program.clone());
                entry.args.extend(prefix_args.iter().cloned());
                let entry = entry.arg("serve").arg(capability.as_str());
                ToolServerSpec::new(name, capability, port, entry)
            })
            .collect()
    }
}

const BUILTIN: [(&str, Capability, u16); 3] = [
    ("weather", Capability::Weather, 8001),
    ("sql_query", Capability::Sql, 8002),
    ("ppt_translator", Capability::PptTranslate, 8003),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_specs_use_default_ports() {
        let specs = ToolServerSpec::builtin("/usr/bin/toolhub", &[]);
        let ports: Vec<_> = specs.iter().map(|s| s.default_port).collect();
        assert_eq!(ports, [8001, 8002, 8003]);
        assert_eq!(specs[2].entry.args, ["serve", "ppt-translate"]);
    }

    #[test]
    fn prefix_args_come_before_subcommand() {
        let prefix = vec!["--config".to_string(), "hub.toml".to_string()];
        let specs = ToolServerSpec::builtin("toolhub", &prefix);
        assert_eq!(specs[0].entry.args, ["--config", "hub.toml", "serve", "weather"]);
    }

    #[test]
    fn capability_round_trips_through_str() {
        for capability in Capability::ALL {
            assert_eq!(capability.as_str().parse::<Capability>().unwrap(), capability);
        }
        assert!("rag".parse::<Capability>().is_err());
        assert_eq!(Capability::Sql.default_port(), 8002);
    }
}
