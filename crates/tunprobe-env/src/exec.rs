use std::fmt::Display;

/// A command to run inside a role container.
///
/// Strings convert into [`ExecCommand::Shell`] and are handed to `sh -c`
/// untouched, so pipes, redirections and quoting behave exactly as typed.
/// Use [`ExecCommand::Argv`] to bypass the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecCommand {
	Shell(String),
	Argv(Vec<String>),
}

impl ExecCommand {
	pub fn argv<I, S>(args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		ExecCommand::Argv(args.into_iter().map(Into::into).collect())
	}

	pub fn to_argv(&self) -> Vec<String> {
		match self {
			ExecCommand::Shell(script) => vec!["sh".into(), "-c".into(), script.clone()],
			ExecCommand::Argv(argv) => argv.clone(),
		}
	}
}

impl From<&str> for ExecCommand {
	fn from(value: &str) -> Self {
		ExecCommand::Shell(value.to_string())
	}
}

impl From<String> for ExecCommand {
	fn from(value: String) -> Self {
		ExecCommand::Shell(value)
	}
}

impl Display for ExecCommand {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ExecCommand::Shell(script) => f.write_str(script),
			ExecCommand::Argv(argv) => {
				let quoted: Vec<_> = argv.iter().map(|arg| shell_quote(arg)).collect();
				f.write_str(&quoted.join(" "))
			}
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
	pub exit_code: i64,
	/// stdout and stderr, interleaved as produced.
	pub output:    String,
}

impl ExecOutput {
	pub fn success(&self) -> bool {
		self.exit_code == 0
	}
}

/// Quote `arg` for POSIX `sh`. Plain words pass through unchanged.
pub fn shell_quote(arg: &str) -> String {
	let plain = !arg.is_empty()
		&& arg
			.bytes()
			.all(|b| b.is_ascii_alphanumeric() || b"@%+=:,./-_".contains(&b));
	if plain {
		arg.to_string()
	} else {
		format!("'{}'", arg.replace('\'', r"'\''"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_shell_strings_are_not_requoted() {
		let cmd = ExecCommand::from("iptables -t nat -L POSTROUTING -n | grep MASQUERADE");
		assert_eq!(cmd.to_argv(), [
			"sh",
			"-c",
			"iptables -t nat -L POSTROUTING -n | grep MASQUERADE"
		]);
	}

	#[test]
	fn test_argv_runs_literally() {
		let cmd = ExecCommand::argv(["ip", "link", "show", "tun-x2ssh"]);
		assert_eq!(cmd.to_argv(), ["ip", "link", "show", "tun-x2ssh"]);
		assert_eq!(cmd.to_string(), "ip link show tun-x2ssh");
	}

	#[test]
	fn test_shell_quote() {
		assert_eq!(shell_quote("root@10.10.0.20"), "root@10.10.0.20");
		assert_eq!(shell_quote("/etc/x2ssh/config.toml"), "/etc/x2ssh/config.toml");
		assert_eq!(shell_quote("a b"), "'a b'");
		assert_eq!(shell_quote(""), "''");
		assert_eq!(shell_quote("it's"), r"'it'\''s'");
		assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
	}

	#[test]
	fn test_exec_output_success() {
		let ok = ExecOutput {
			exit_code: 0,
			output:    String::new(),
		};
		let failed = ExecOutput {
			exit_code: 1,
			..ok.clone()
		};
		assert!(ok.success());
		assert!(!failed.success());
	}
}
