//! Queued commands: a name plus optional arguments.
//!
//! A command is either a bare name (`"generate-invoices"`) or a name with
//! ordered positional arguments (`("generate-user-invoice", ["150"])`). Both
//! resolve to a flat token list at dispatch time, which the launcher appends
//! after its executable and entry point.

use crate::error::{QueueError, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// One unit of queued work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandSpec {
    /// Command name only.
    Simple(String),
    /// Command name followed by positional arguments.
    WithArgs(String, Vec<String>),
}

impl CommandSpec {
    /// Create a command without arguments.
    pub fn simple(name: impl Into<String>) -> Self {
        CommandSpec::Simple(name.into())
    }

    /// Create a command with positional arguments.
    ///
    /// An empty argument list yields [`CommandSpec::Simple`], the form a
    /// deserialized argument-less command takes.
    pub fn with_args<I, A>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: ToString,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.to_string()).collect();
        if args.is_empty() {
            CommandSpec::Simple(name.into())
        } else {
            CommandSpec::WithArgs(name.into(), args)
        }
    }

    /// Parse a whitespace separated command line such as `"send-report 12 weekly"`.
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let name = parts.next().ok_or_else(|| QueueError::InvalidCommand {
            message: "command line is empty".to_string(),
        })?;
        Ok(Self::with_args(name, parts))
    }

    /// The command name token.
    pub fn name(&self) -> &str {
        match self {
            CommandSpec::Simple(name) | CommandSpec::WithArgs(name, _) => name,
        }
    }

    /// Positional arguments, empty for [`CommandSpec::Simple`].
    pub fn args(&self) -> &[String] {
        match self {
            CommandSpec::Simple(_) => &[],
            CommandSpec::WithArgs(_, args) => args,
        }
    }

    /// Resolve to the ordered token list: name, then each argument.
    pub fn tokens(&self) -> Vec<String> {
        let mut tokens = Vec::with_capacity(1 + self.args().len());
        tokens.push(self.name().to_string());
        tokens.extend(self.args().iter().cloned());
        tokens
    }
}

impl From<&str> for CommandSpec {
    fn from(name: &str) -> Self {
        CommandSpec::simple(name)
    }
}

impl From<String> for CommandSpec {
    fn from(name: String) -> Self {
        CommandSpec::Simple(name)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tokens().join(" "))
    }
}

impl Serialize for CommandSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            CommandSpec::Simple(name) => serializer.serialize_str(name),
            CommandSpec::WithArgs(name, args) if args.is_empty() => serializer.serialize_str(name),
            CommandSpec::WithArgs(name, args) => (name, args).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CommandSpec {
    /// Accepts `"name"`, `["name", [arg, ...]]` and the flat form
    /// `["name", arg, ...]`. Numeric and boolean arguments are rendered with
    /// their JSON text.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(name) => Ok(CommandSpec::Simple(name)),
            Value::Array(items) => {
                let mut items = items.into_iter();
                let name = match items.next() {
                    Some(Value::String(name)) => name,
                    Some(other) => {
                        return Err(D::Error::custom(format!(
                            "command name must be a string, got {other}"
                        )))
                    }
                    None => return Err(D::Error::custom("command array is empty")),
                };

                let mut args = Vec::new();
                for item in items {
                    match item {
                        Value::Array(nested) => {
                            for arg in nested {
                                args.push(arg_token(arg).map_err(D::Error::custom)?);
                            }
                        }
                        other => args.push(arg_token(other).map_err(D::Error::custom)?),
                    }
                }

                if args.is_empty() {
                    Ok(CommandSpec::Simple(name))
                } else {
                    Ok(CommandSpec::WithArgs(name, args))
                }
            }
            other => Err(D::Error::custom(format!(
                "expected a command string or array, got {other}"
            ))),
        }
    }
}

fn arg_token(value: Value) -> std::result::Result<String, String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!("unsupported command argument: {other}")),
    }
}

/// Parse a JSON array of commands, as found in a queue file.
pub fn parse_queue_json(json: &str) -> Result<Vec<CommandSpec>> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_tokens() {
        let spec = CommandSpec::simple("generate-invoices");
        assert_eq!(spec.tokens(), vec!["generate-invoices"]);
        assert!(spec.args().is_empty());
    }

    #[test]
    fn test_tokens_keep_argument_order() {
        let spec = CommandSpec::with_args("generate-user-invoice", [150]);
        assert_eq!(spec.tokens(), vec!["generate-user-invoice", "150"]);

        let spec = CommandSpec::with_args("copy", ["b", "a", "c"]);
        assert_eq!(spec.tokens(), vec!["copy", "b", "a", "c"]);
    }

    #[test]
    fn test_parse_line() {
        let spec = CommandSpec::parse_line("  send-report 12   weekly ").unwrap();
        assert_eq!(spec, CommandSpec::with_args("send-report", ["12", "weekly"]));

        let spec = CommandSpec::parse_line("cleanup").unwrap();
        assert_eq!(spec, CommandSpec::simple("cleanup"));
    }

    #[test]
    fn test_parse_line_empty() {
        let err = CommandSpec::parse_line("   ").unwrap_err();
        assert!(matches!(err, QueueError::InvalidCommand { .. }));
    }

    #[test]
    fn test_display_joins_tokens() {
        let spec = CommandSpec::with_args("generate-user-invoice", [150]);
        assert_eq!(spec.to_string(), "generate-user-invoice 150");
    }

    #[test]
    fn test_deserialize_forms() {
        let specs = parse_queue_json(
            r#"["generate-invoices", ["generate-user-invoice", [150]], ["resize", "a.png", 2, true]]"#,
        )
        .unwrap();

        assert_eq!(
            specs,
            vec![
                CommandSpec::simple("generate-invoices"),
                CommandSpec::with_args("generate-user-invoice", ["150"]),
                CommandSpec::with_args("resize", ["a.png", "2", "true"]),
            ]
        );
    }

    #[test]
    fn test_deserialize_rejects_bad_shapes() {
        assert!(parse_queue_json("[42]").is_err());
        assert!(parse_queue_json("[[]]").is_err());
        assert!(parse_queue_json(r#"[["cmd", {"a": 1}]]"#).is_err());
    }

    #[test]
    fn test_serialize_shapes() {
        let json = serde_json::to_string(&vec![
            CommandSpec::simple("a"),
            CommandSpec::with_args("b", [1, 2]),
        ])
        .unwrap();
        assert_eq!(json, r#"["a",["b",["1","2"]]]"#);
    }

    #[test]
    fn test_empty_args_survive_json() {
        let spec = CommandSpec::with_args("x", Vec::<String>::new());
        assert_eq!(spec, CommandSpec::simple("x"));

        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#""x""#);
        let back: CommandSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);

        let raw = CommandSpec::WithArgs("x".to_string(), Vec::new());
        assert_eq!(serde_json::to_string(&raw).unwrap(), r#""x""#);
    }
}
