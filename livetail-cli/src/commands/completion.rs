//! Shell completion scripts.

use std::io;

use clap::CommandFactory;
use clap_complete::{Shell, generate};

pub fn generate_completion(shell: Shell) {
    let mut command = crate::Cli::command();
    generate(shell, &mut command, "livetail", &mut io::stdout());
}
