//! Whelk CLI - Test harness for whelk shell sessions
//!
//! Usage:
//!   whelk -c "command"     Execute a command string
//!   whelk script.sh        Execute a script file
//!   whelk                   Read the command from stdin

use std::io::{self, Read, Write};

use whelk::Whelk;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = if args.len() >= 3 && args[1] == "-c" {
        // Inline command: whelk -c "echo hello"
        args[2].clone()
    } else if args.len() >= 2 && args[1] != "-c" {
        // Script file: whelk script.sh
        match std::fs::read_to_string(&args[1]) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("whelk: {}: {}", args[1], e);
                std::process::exit(1);
            }
        }
    } else {
        // Read from stdin
        let mut command = String::new();
        if let Err(e) = io::stdin().read_to_string(&mut command) {
            eprintln!("whelk: failed to read stdin: {}", e);
            std::process::exit(1);
        }
        command
    };

    let whelk = Whelk::builder().build();

    let success = match whelk.run_command(&command, None).await {
        Ok(success) => success,
        Err(e) => {
            eprintln!("whelk: execution error: {}", e);
            std::process::exit(1);
        }
    };

    // The run is recorded before anything is printed; read it back out.
    let entries = match whelk.history(None, 1).await {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("whelk: failed to read history: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(entry) = entries.first() {
        io::stdout().write_all(entry.output.as_bytes()).ok();
        io::stderr().write_all(entry.error.as_bytes()).ok();
    }

    std::process::exit(if success { 0 } else { 1 });
}
