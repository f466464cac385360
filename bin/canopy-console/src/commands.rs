//! ---
//! canopy_section: "04-operator-console"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Parser for the console's interactive line commands."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use anyhow::{anyhow, bail, Context, Result};
use canopy_msg::ActuatorValue;
use serde_json::Value as JsonValue;

pub const HELP: &str = "\
commands:
  set <name> <on|off|number>      force an actuator
  toggle <name>                   invert an actuator
  clear <name>                    release one override
  clear-all                       release every override
  goal <text...>                  hand a goal to the planner
  edit <section> <field> <value>  edit a setting (saved after a quiet period)
  close <section>                 save a section now
  send <command> [json]           raw streaming command
  ping                            probe the streaming channel
  status                          backend health
  show                            actuator table and liveness
  settings                        persisted settings
  metrics                         bridge counters
  help                            this text
  quit                            flush drafts and exit";

/// One line typed by the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Set { name: String, value: ActuatorValue },
    Toggle { name: String },
    Clear { name: String },
    ClearAll,
    Goal(String),
    Edit {
        section: String,
        field: String,
        value: JsonValue,
    },
    Close { section: String },
    Send { command: String, payload: JsonValue },
    Ping,
    Status,
    Show,
    Settings,
    Metrics,
    Help,
    Quit,
}

impl OperatorCommand {
    /// Parse a line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        let Some((verb, rest)) = split_word(line) else {
            return Ok(None);
        };

        let command = match verb {
            "set" => {
                let (name, value) = two_words(rest, "set <name> <value>")?;
                Self::Set {
                    name: name.to_owned(),
                    value: parse_actuator_value(value)?,
                }
            }
            "toggle" => Self::Toggle {
                name: one_word(rest, "toggle <name>")?,
            },
            "clear" => Self::Clear {
                name: one_word(rest, "clear <name>")?,
            },
            "clear-all" => Self::ClearAll,
            "goal" => {
                if rest.is_empty() {
                    bail!("usage: goal <text...>");
                }
                Self::Goal(rest.to_owned())
            }
            "edit" => {
                let (section, rest) =
                    split_word(rest).ok_or_else(|| anyhow!("usage: edit <section> <field> <value>"))?;
                let (field, value) = two_words(rest, "edit <section> <field> <value>")?;
                Self::Edit {
                    section: section.to_owned(),
                    field: field.to_owned(),
                    value: parse_setting_value(value),
                }
            }
            "close" => Self::Close {
                section: one_word(rest, "close <section>")?,
            },
            "send" => {
                let (command, payload) =
                    split_word(rest).ok_or_else(|| anyhow!("usage: send <command> [json]"))?;
                let payload = if payload.is_empty() {
                    JsonValue::Object(Default::default())
                } else {
                    serde_json::from_str(payload).context("payload is not valid JSON")?
                };
                Self::Send {
                    command: command.to_owned(),
                    payload,
                }
            }
            "ping" => Self::Ping,
            "status" => Self::Status,
            "show" => Self::Show,
            "settings" => Self::Settings,
            "metrics" => Self::Metrics,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command `{other}`; try `help`"),
        };
        Ok(Some(command))
    }
}

fn split_word(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => Some((word, rest.trim())),
        None => Some((text, "")),
    }
}

fn one_word(text: &str, usage: &str) -> Result<String> {
    match split_word(text) {
        Some((word, "")) => Ok(word.to_owned()),
        _ => bail!("usage: {usage}"),
    }
}

fn two_words<'a>(text: &'a str, usage: &str) -> Result<(&'a str, &'a str)> {
    match split_word(text) {
        Some((first, second)) if !second.is_empty() => Ok((first, second)),
        _ => bail!("usage: {usage}"),
    }
}

/// `on`/`off`/`true`/`false` or a number.
pub fn parse_actuator_value(text: &str) -> Result<ActuatorValue> {
    match text.to_ascii_lowercase().as_str() {
        "on" | "true" => Ok(ActuatorValue::Bool(true)),
        "off" | "false" => Ok(ActuatorValue::Bool(false)),
        other => other
            .parse::<f64>()
            .ok()
            .filter(|number| number.is_finite())
            .map(ActuatorValue::Number)
            .ok_or_else(|| anyhow!("`{text}` is neither on/off nor a number")),
    }
}

// Settings values are JSON when they parse as JSON, plain strings otherwise.
fn parse_setting_value(text: &str) -> JsonValue {
    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_actuator_commands() {
        assert_eq!(
            OperatorCommand::parse("set water_pump on").unwrap(),
            Some(OperatorCommand::Set {
                name: "water_pump".into(),
                value: ActuatorValue::Bool(true),
            })
        );
        assert_eq!(
            OperatorCommand::parse("  set nutrient_a 0.4 ").unwrap(),
            Some(OperatorCommand::Set {
                name: "nutrient_a".into(),
                value: ActuatorValue::Number(0.4),
            })
        );
        assert_eq!(
            OperatorCommand::parse("toggle lights").unwrap(),
            Some(OperatorCommand::Toggle {
                name: "lights".into()
            })
        );
        assert_eq!(
            OperatorCommand::parse("clear-all").unwrap(),
            Some(OperatorCommand::ClearAll)
        );
    }

    #[test]
    fn goal_keeps_the_whole_sentence() {
        assert_eq!(
            OperatorCommand::parse("goal raise humidity to 70%").unwrap(),
            Some(OperatorCommand::Goal("raise humidity to 70%".into()))
        );
        assert!(OperatorCommand::parse("goal").is_err());
    }

    #[test]
    fn edit_values_fall_back_to_strings() {
        assert_eq!(
            OperatorCommand::parse("edit nutrients target_ph 6.1").unwrap(),
            Some(OperatorCommand::Edit {
                section: "nutrients".into(),
                field: "target_ph".into(),
                value: json!(6.1),
            })
        );
        assert_eq!(
            OperatorCommand::parse("edit lighting schedule dawn to dusk").unwrap(),
            Some(OperatorCommand::Edit {
                section: "lighting".into(),
                field: "schedule".into(),
                value: json!("dawn to dusk"),
            })
        );
        assert!(OperatorCommand::parse("edit lighting").is_err());
    }

    #[test]
    fn send_requires_valid_json_payload() {
        assert_eq!(
            OperatorCommand::parse(r#"send START_IRRIGATION {"zone": "north"}"#).unwrap(),
            Some(OperatorCommand::Send {
                command: "START_IRRIGATION".into(),
                payload: json!({"zone": "north"}),
            })
        );
        assert_eq!(
            OperatorCommand::parse("send STOP_ALL").unwrap(),
            Some(OperatorCommand::Send {
                command: "STOP_ALL".into(),
                payload: json!({}),
            })
        );
        assert!(OperatorCommand::parse("send STOP_ALL {broken").is_err());
    }

    #[test]
    fn rejects_unknown_and_malformed_lines() {
        assert_eq!(OperatorCommand::parse("   ").unwrap(), None);
        assert!(OperatorCommand::parse("launch").is_err());
        assert!(OperatorCommand::parse("set water_pump").is_err());
        assert!(OperatorCommand::parse("set water_pump maybe").is_err());
        assert!(OperatorCommand::parse("toggle a b").is_err());
    }
}
