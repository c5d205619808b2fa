//! Destination Registry: an immutable table mapping a path-prefix name to a
//! transport-specific upstream.
//!
//! Every destination is resolved once, up front, into one of three live
//! transport shapes (SSE, Streamable HTTP, stdio); nothing about a
//! destination changes after startup.

use std::collections::HashMap;

use reqwest::Url;

use crate::prelude::*;
use crate::scanner::ScannerSettings;

/// Destination names are used verbatim as a URL path segment.
const NAME_MAX_LEN: usize = 64;

#[derive(Debug, Clone)]
pub enum DestinationKind {
	Sse { upstream_url: Url },
	StreamableHttp { upstream_url: Url },
	Stdio {
		command: String,
		args: Vec<String>,
		/// Extra environment variables layered on top of the strict
		/// allowlist when the bridge spawns the child (§4.6).
		env: HashMap<String, String>,
	},
}

impl DestinationKind {
	pub fn label(&self) -> &'static str {
		match self {
			DestinationKind::Sse { .. } => "sse",
			DestinationKind::StreamableHttp { .. } => "streamable_http",
			DestinationKind::Stdio { .. } => "stdio",
		}
	}

	pub fn is_stdio(&self) -> bool {
		matches!(self, DestinationKind::Stdio { .. })
	}
}

#[derive(Debug, Clone)]
pub struct Destination {
	pub name: String,
	pub kind: DestinationKind,
	/// Per-destination scanner hook configuration (§4.7); defaults to off
	/// for destinations whose raw config doesn't mention it.
	pub scanner: ScannerSettings,
}

/// Raw, untrusted destination input as it would arrive from an external
/// loader (§4.1 treats registry loading as outside this crate's scope; we
/// still need a concrete shape to validate against and build `Destination`
/// values from).
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RawDestination {
	Sse {
		name: String,
		upstream_url: String,
		#[serde(default)]
		scanner: ScannerSettings,
	},
	StreamableHttp {
		name: String,
		upstream_url: String,
		#[serde(default)]
		scanner: ScannerSettings,
	},
	Stdio {
		name: String,
		command: String,
		#[serde(default)]
		env: HashMap<String, String>,
		#[serde(default)]
		scanner: ScannerSettings,
	},
}

impl Destination {
	fn validate_name(name: &str) -> anyhow::Result<()> {
		if name.is_empty() || name.len() > NAME_MAX_LEN {
			anyhow::bail!("destination name {name:?} must be 1-{NAME_MAX_LEN} chars");
		}
		if !name
			.bytes()
			.all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
		{
			anyhow::bail!("destination name {name:?} must match [A-Za-z0-9_-]+");
		}
		Ok(())
	}

	fn validate_upstream_url(raw: &str) -> anyhow::Result<Url> {
		let url = Url::parse(raw).map_err(|e| anyhow::anyhow!("invalid upstream_url {raw:?}: {e}"))?;
		match url.scheme() {
			"http" | "https" => Ok(url),
			other => anyhow::bail!("upstream_url scheme {other:?} is not http/https"),
		}
	}

	pub fn from_raw(raw: RawDestination) -> anyhow::Result<Destination> {
		match raw {
			RawDestination::Sse { name, upstream_url, scanner } => {
				Destination::validate_name(&name)?;
				let upstream_url = Destination::validate_upstream_url(&upstream_url)?;
				Ok(Destination {
					name,
					kind: DestinationKind::Sse { upstream_url },
					scanner,
				})
			},
			RawDestination::StreamableHttp { name, upstream_url, scanner } => {
				Destination::validate_name(&name)?;
				let upstream_url = Destination::validate_upstream_url(&upstream_url)?;
				Ok(Destination {
					name,
					kind: DestinationKind::StreamableHttp { upstream_url },
					scanner,
				})
			},
			RawDestination::Stdio { name, command, env, scanner } => {
				Destination::validate_name(&name)?;
				let (command, args) = parse_command_line(&command)?;
				which::which(&command)
					.map_err(|e| anyhow::anyhow!("stdio destination {name:?}: command {command:?} not found on PATH: {e}"))?;
				Ok(Destination {
					name,
					kind: DestinationKind::Stdio { command, args, env },
					scanner,
				})
			},
		}
	}
}

/// Splits a command line into argv the way a POSIX shell would, without
/// ever invoking a shell. Supports single and double quoting and backslash
/// escapes inside double quotes; rejects any of the shell metacharacters
/// listed in §4.1 (`; | & $ > < \` newline`) outside of quotes, since
/// honoring them would mean re-implementing shell semantics we explicitly
/// don't want running.
pub fn parse_command_line(line: &str) -> anyhow::Result<(String, Vec<String>)> {
	const FORBIDDEN: &[char] = &[';', '|', '&', '$', '>', '<', '`', '\n'];

	let mut tokens = Vec::new();
	let mut current = String::new();
	let mut in_token = false;
	let mut chars = line.chars().peekable();

	while let Some(c) = chars.next() {
		match c {
			'\'' => {
				in_token = true;
				for c in chars.by_ref() {
					if c == '\'' {
						break;
					}
					current.push(c);
				}
			},
			'"' => {
				in_token = true;
				while let Some(c) = chars.next() {
					match c {
						'"' => break,
						'\\' if matches!(chars.peek(), Some('"') | Some('\\')) => {
							current.push(chars.next().unwrap());
						},
						other => current.push(other),
					}
				}
			},
			c if c.is_whitespace() => {
				if in_token {
					tokens.push(std::mem::take(&mut current));
					in_token = false;
				}
			},
			c if FORBIDDEN.contains(&c) => {
				anyhow::bail!("command line contains disallowed shell metacharacter {c:?}");
			},
			c => {
				in_token = true;
				current.push(c);
			},
		}
	}
	if in_token {
		tokens.push(current);
	}

	let mut iter = tokens.into_iter();
	let command = iter
		.next()
		.ok_or_else(|| anyhow::anyhow!("empty command line"))?;
	Ok((command, iter.collect()))
}

#[derive(Debug)]
pub struct Registry {
	by_name: HashMap<String, Arc<Destination>>,
}

impl Registry {
	pub fn from_destinations(destinations: Vec<Destination>) -> anyhow::Result<Registry> {
		let mut by_name = HashMap::with_capacity(destinations.len());
		for d in destinations {
			if by_name.contains_key(&d.name) {
				anyhow::bail!("duplicate destination name {:?}", d.name);
			}
			by_name.insert(d.name.clone(), Arc::new(d));
		}
		Ok(Registry { by_name })
	}

	pub fn lookup(&self, name: &str) -> Option<Arc<Destination>> {
		self.by_name.get(name).cloned()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Arc<Destination>> {
		self.by_name.values()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_quoted_command_line() {
		let (cmd, args) = parse_command_line("python3 -m 'my module' \"--flag=a b\"").unwrap();
		assert_eq!(cmd, "python3");
		assert_eq!(args, vec!["-m", "my module", "--flag=a b"]);
	}

	#[test]
	fn rejects_shell_metacharacters() {
		assert!(parse_command_line("cat /etc/passwd; rm -rf /").is_err());
		assert!(parse_command_line("echo $HOME").is_err());
		assert!(parse_command_line("a | b").is_err());
	}

	#[test]
	fn rejects_bad_destination_names() {
		assert!(Destination::validate_name("weird name!").is_err());
		assert!(Destination::validate_name(&"a".repeat(65)).is_err());
		assert!(Destination::validate_name("ok-name_1").is_ok());
	}

	#[test]
	fn rejects_non_http_scheme() {
		assert!(Destination::validate_upstream_url("ftp://example.com").is_err());
		assert!(Destination::validate_upstream_url("https://example.com/mcp").is_ok());
	}
}
