//! Shell completions command

use std::io;

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::Shell;

use crate::cli::Cli;

pub fn run(shell: Shell) -> Result<()> {
    write_completions(shell, &mut io::stdout());
    Ok(())
}

fn write_completions(shell: Shell, out: &mut dyn io::Write) {
    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, bin_name, out);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bash_completions_cover_commands() {
        let mut buffer = Vec::new();
        write_completions(Shell::Bash, &mut buffer);

        let script = String::from_utf8(buffer).unwrap();
        assert!(script.contains("pplx-assist"));
        for command in ["ask", "chat", "task", "check", "agents", "diagnostics"] {
            assert!(script.contains(command), "missing {command}");
        }
    }
}
