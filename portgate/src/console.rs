//! Line-oriented operator console on stdin

use anyhow::Result;
use portgate_core::{Action, EventLog, PolicyEngine, Protocol, ProxyManager, Rule, RuleStore};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
Commands:
  list                                              show all rules
  add <src> <port> <tcp|udp|any> <allow|deny> [prio] add a rule
  del <id>                                          remove a rule
  save                                              write rules to disk
  proxy <lport> <host> <tport>                      start a forwarding listener
  logs [filter]                                     show block events
  help                                              this text
  quit | exit                                       shut down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    List,
    Add(Rule),
    Delete(String),
    Save,
    Proxy {
        listen_port: u16,
        target_host: String,
        target_port: u16,
    },
    Logs(Option<String>),
    Quit,
    Empty,
}

/// Parse one console line. `Err` carries the usage text to print.
pub fn parse_command(line: &str) -> std::result::Result<Command, &'static str> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(first) = parts.first() else {
        return Ok(Command::Empty);
    };

    match first.to_ascii_lowercase().as_str() {
        "help" | "?" => Ok(Command::Help),
        "list" | "ls" => Ok(Command::List),
        "save" => Ok(Command::Save),
        "quit" | "exit" => Ok(Command::Quit),
        "add" => parse_add(&parts[1..]),
        "del" | "delete" => match parts.get(1) {
            Some(id) if parts.len() == 2 => Ok(Command::Delete(id.to_string())),
            _ => Err("Usage: del <id>"),
        },
        "proxy" => {
            const USAGE: &str = "Usage: proxy <lport> <host> <tport>";
            let [_, lport, host, tport] = parts.as_slice() else {
                return Err(USAGE);
            };
            Ok(Command::Proxy {
                listen_port: lport.parse().map_err(|_| USAGE)?,
                target_host: host.to_string(),
                target_port: tport.parse().map_err(|_| USAGE)?,
            })
        }
        "logs" => Ok(Command::Logs(match parts.len() {
            1 => None,
            _ => Some(parts[1..].join(" ")),
        })),
        _ => Err("Unknown command. Type 'help' for a list."),
    }
}

fn parse_add(args: &[&str]) -> std::result::Result<Command, &'static str> {
    const USAGE: &str = "Usage: add <src> <port> <tcp|udp|any> <allow|deny> [priority]";

    if args.len() < 4 || args.len() > 5 {
        return Err(USAGE);
    }

    let port: u16 = args[1].parse().map_err(|_| USAGE)?;
    let protocol = Protocol::parse(args[2]).ok_or(USAGE)?;
    let action = Action::parse(args[3]).ok_or(USAGE)?;

    let mut rule = Rule::new(action)
        .with_source(args[0])
        .with_destination_port(port)
        .with_protocol(protocol);
    if let Some(priority) = args.get(4) {
        rule = rule.with_priority(priority.parse().map_err(|_| USAGE)?);
    }

    Ok(Command::Add(rule))
}

/// Whether the console should keep reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Console<'a> {
    engine: Arc<PolicyEngine>,
    store: &'a RuleStore,
    events: Arc<EventLog>,
    proxies: &'a mut ProxyManager,
}

impl<'a> Console<'a> {
    pub fn new(
        engine: Arc<PolicyEngine>,
        store: &'a RuleStore,
        events: Arc<EventLog>,
        proxies: &'a mut ProxyManager,
    ) -> Self {
        Self {
            engine,
            store,
            events,
            proxies,
        }
    }

    /// Read commands from stdin until `quit` or end of input
    pub async fn run(&mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut out = std::io::stdout();

        writeln!(out, "Type 'help' for commands.")?;
        loop {
            write!(out, "> ")?;
            out.flush()?;

            let Some(line) = lines.next_line().await? else {
                break;
            };
            let flow = match parse_command(&line) {
                Ok(command) => self.execute(command, &mut out).await?,
                Err(usage) => {
                    writeln!(out, "{}", usage)?;
                    Flow::Continue
                }
            };
            if flow == Flow::Quit {
                break;
            }
        }
        Ok(())
    }

    pub async fn execute<W: Write>(&mut self, command: Command, out: &mut W) -> Result<Flow> {
        match command {
            Command::Empty => {}
            Command::Help => writeln!(out, "{}", HELP)?,
            Command::Quit => return Ok(Flow::Quit),

            Command::List => {
                let rules = self.engine.snapshot();
                if rules.is_empty() {
                    writeln!(out, "No rules.")?;
                }
                for rule in rules {
                    writeln!(out, "{}", rule)?;
                }
            }

            Command::Add(rule) => {
                let id = rule.id.clone();
                for warning in self.engine.add(rule) {
                    writeln!(out, "WARNING: {}", warning)?;
                }
                writeln!(out, "Rule added: {}", id)?;
            }

            Command::Delete(id) => {
                if self.engine.remove(&id) {
                    writeln!(out, "Rule removed: {}", id)?;
                } else {
                    writeln!(out, "No rule with id {}", id)?;
                }
            }

            Command::Save => match self.store.save(&self.engine.snapshot()) {
                Ok(()) => writeln!(out, "Rules saved to {}", self.store.path().display())?,
                Err(e) => writeln!(out, "Save failed: {}", e)?,
            },

            Command::Proxy {
                listen_port,
                target_host,
                target_port,
            } => match self
                .proxies
                .start(listen_port, &target_host, target_port)
                .await
            {
                Ok(addr) => writeln!(
                    out,
                    "Forwarding {} -> {}:{}",
                    addr, target_host, target_port
                )?,
                Err(e) => writeln!(out, "Proxy failed: {}", e)?,
            },

            Command::Logs(filter) => match self.events.read(filter.as_deref()) {
                Ok(lines) if lines.is_empty() => writeln!(out, "No events.")?,
                Ok(lines) => {
                    for line in lines {
                        writeln!(out, "{}", line)?;
                    }
                }
                Err(e) => writeln!(out, "Reading events failed: {}", e)?,
            },
        }

        Ok(Flow::Continue)
    }
}
