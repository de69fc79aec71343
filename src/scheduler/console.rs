use std::sync::Arc;

use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::error;

use crate::cli::TargetArgs;
use crate::config::AppConfig;

use super::job::JobId;
use super::registry::JobRegistry;

const PROMPT: &str = "schedule> ";

#[derive(Parser)]
#[command(name = "schedule", disable_version_flag = true)]
struct ConsoleLine {
    #[command(subcommand)]
    command: ConsoleCommand,
}

#[derive(Subcommand)]
enum ConsoleCommand {
    /// Register a recurring backup and print its id
    Add(AddJobArgs),
    /// List active jobs with their last result
    List,
    /// Remove a job by id
    Remove {
        #[arg(short = 'j', long)]
        id: JobId,
    },
    /// Leave the console and stop the scheduler
    #[command(alias = "quit")]
    Exit,
}

#[derive(Args)]
struct AddJobArgs {
    /// Cron expression, named interval (@daily, "every minute") or @every <duration>
    #[arg(short = 'c', long)]
    trigger: String,

    #[command(flatten)]
    target: TargetArgs,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleReply {
    Output(String),
    Exit,
}

/// Line-oriented front end to a running scheduler's registry.
pub struct JobConsole {
    registry: Arc<JobRegistry>,
    config: AppConfig,
}

impl JobConsole {
    pub fn new(registry: Arc<JobRegistry>, config: AppConfig) -> Self {
        Self { registry, config }
    }

    /// Blocking read-eval loop; returns on `exit`, Ctrl-C or Ctrl-D.
    pub fn start_interactive(&self) -> rustyline::Result<()> {
        println!("🗓️  pgguard scheduler console");
        println!("Type 'help' for available commands, 'exit' to stop the scheduler");
        println!();

        let mut rl = DefaultEditor::new()?;
        loop {
            match rl.readline(PROMPT) {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    rl.add_history_entry(line)?;
                    match self.execute(line) {
                        Ok(ConsoleReply::Output(text)) => {
                            if !text.is_empty() {
                                println!("{}", text.trim_end());
                            }
                        }
                        Ok(ConsoleReply::Exit) => break,
                        Err(message) => eprintln!("{}", message.trim_end()),
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("CTRL-C pressed, exiting...");
                    break;
                }
                Err(ReadlineError::Eof) => {
                    println!("CTRL-D pressed, exiting...");
                    break;
                }
                Err(err) => {
                    error!("Error reading line: {:?}", err);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Runs one console command. `Err` carries a message for the user.
    pub fn execute(&self, line: &str) -> Result<ConsoleReply, String> {
        let mut words = shell_words::split(line).map_err(|e| format!("could not parse input: {e}"))?;
        if words.is_empty() {
            return Ok(ConsoleReply::Output(String::new()));
        }
        words.insert(0, "schedule".to_string());

        let parsed = match ConsoleLine::try_parse_from(words) {
            Ok(parsed) => parsed,
            Err(e) => {
                return match e.kind() {
                    ErrorKind::DisplayHelp | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                        Ok(ConsoleReply::Output(e.render().to_string()))
                    }
                    _ => Err(e.render().to_string()),
                };
            }
        };

        match parsed.command {
            ConsoleCommand::Add(args) => {
                let target = args.target.to_target(&self.config).map_err(|e| e.to_string())?;
                let id = self.registry.add(&args.trigger, target).map_err(|e| e.to_string())?;
                Ok(ConsoleReply::Output(format!("Added job {id}")))
            }
            ConsoleCommand::List => {
                let jobs = self.registry.list();
                if jobs.is_empty() {
                    return Ok(ConsoleReply::Output("No active jobs".to_string()));
                }
                let lines: Vec<String> = jobs.iter().map(|job| job.describe()).collect();
                Ok(ConsoleReply::Output(lines.join("\n")))
            }
            ConsoleCommand::Remove { id } => {
                self.registry.remove(id).map_err(|e| e.to_string())?;
                Ok(ConsoleReply::Output(format!("Removed job {id}")))
            }
            ConsoleCommand::Exit => Ok(ConsoleReply::Exit),
        }
    }
}
