//! Operator console for the perch node.
//!
//! Supported commands:
//!   c | /capture        – capture and localize the last requested objects
//!   /request <id>       – localize one named object
//!   /goal <id> [id …]   – submit a goal and report its outcome
//!   /cancel             – preempt the current goal
//!   /status             – show the current goal
//!   /help               – show this list
//!   /quit | /exit       – stop the node

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use perch_middleware::{EventBus, GoalOutcome, GoalServer, Topic};
use perch_types::{Event, EventPayload};
use tokio::runtime::Handle;

const EVENT_SOURCE: &str = "perch-cli::console";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Capture,
    Request(String),
    Goal(Vec<String>),
    Cancel,
    Status,
    Help,
    Quit,
    Usage(&'static str),
    Unknown(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    let head = words.next()?;
    let args: Vec<String> = words.map(str::to_string).collect();
    let cmd = match head {
        "c" | "/capture" => Command::Capture,
        "/request" => match args.as_slice() {
            [id] => Command::Request(id.clone()),
            _ => Command::Usage("/request <object-id>"),
        },
        // An empty goal is forwarded; the pipeline rejects it.
        "/goal" => Command::Goal(args),
        "/cancel" => Command::Cancel,
        "/status" => Command::Status,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    };
    Some(cmd)
}

/// Run the console on the calling thread until EOF, `/quit` or `shutdown`.
///
/// Goal outcomes are awaited on `runtime` and printed when they resolve.
pub fn run(bus: &EventBus, goals: &GoalServer, runtime: &Handle, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "perch>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let Some(cmd) = parse_command(&line) else {
            continue;
        };

        match cmd {
            Command::Capture => publish_trigger(bus, EventPayload::Keypress('c')),
            Command::Request(id) => publish_trigger(bus, EventPayload::ObjectRequest(id)),
            Command::Goal(object_ids) => cmd_goal(goals, runtime, object_ids),
            Command::Cancel => match goals.preempt_current() {
                Some(id) => println!("  Preempt requested for goal {}", id.to_string().yellow()),
                None => println!("  {}", "No active goal.".dimmed()),
            },
            Command::Status => cmd_status(goals),
            Command::Help => cmd_help(),
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Command::Usage(usage) => println!("{} {}", "Usage:".red(), usage.bold()),
            Command::Unknown(other) => {
                println!(
                    "{} '{}'. Type {} for available commands.",
                    "Unknown command:".red(),
                    other.yellow(),
                    "/help".bold()
                );
            }
        }
    }
}

fn publish_trigger(bus: &EventBus, payload: EventPayload) {
    if let Err(e) = bus.publish_to(Topic::Triggers, Event::new(EVENT_SOURCE, payload)) {
        println!("{}: {}", "Trigger not delivered".red(), e);
    }
}

fn cmd_goal(goals: &GoalServer, runtime: &Handle, object_ids: Vec<String>) {
    let handle = goals.submit(object_ids.clone());
    let id = handle.id();
    println!(
        "  Goal {} submitted for [{}]",
        id.to_string().yellow(),
        object_ids.join(", ")
    );
    runtime.spawn(async move {
        let line = match handle.outcome().await {
            Some(GoalOutcome::Succeeded(poses)) => {
                format!("{} ({} pose(s))", "succeeded".green(), poses.len())
            }
            Some(GoalOutcome::Aborted(_)) => "aborted".red().to_string(),
            Some(GoalOutcome::Preempted(poses)) => {
                format!("{} ({} pose(s))", "preempted".yellow(), poses.len())
            }
            None => "superseded".dimmed().to_string(),
        };
        println!("\n  Goal {id} {line}");
    });
}

fn cmd_status(goals: &GoalServer) {
    match goals.active_goal() {
        Some(goal) => println!(
            "  Active goal {} for [{}]{}",
            goal.id.to_string().yellow(),
            goal.object_ids.join(", "),
            if goals.is_preempt_requested(goal.id) {
                " (preempt requested)".dimmed().to_string()
            } else {
                String::new()
            }
        ),
        None => println!("  {}", "No active goal.".dimmed()),
    }
}

fn cmd_help() {
    println!();
    println!("{}", "Perch Commands".bold().underline());
    println!("  {}      – capture the last requested objects", "c  /capture".bold().cyan());
    println!("  {}    – localize one named object", "/request <id>".bold().cyan());
    println!("  {} – submit a localization goal", "/goal <id> [id …]".bold().cyan());
    println!("  {}          – preempt the current goal", "/cancel".bold().cyan());
    println!("  {}          – show the current goal", "/status".bold().cyan());
    println!("  {}     – stop the node", "/quit  /exit".bold().cyan());
    println!();
}
