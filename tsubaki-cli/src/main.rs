//! Tsubaki CLI - コマンドラインインターフェース
//!
//! CPython埋め込みプロセス用の混在モードデバッガ tsubaki のREPL
//! インターフェース

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tsubaki_core::{Command, Debugger, StepKind, StopReason};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// Tsubaki - Mixed-Mode Python Debugger
#[derive(Parser)]
#[command(name = "tsubaki")]
#[command(version = "0.1.0")]
#[command(about = "Out-of-process debugger for embedded CPython runtimes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: DebugCommand,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Attach to a process embedding CPython
    Attach {
        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    println!("Tsubaki - Mixed-Mode Python Debugger");
    println!("Version 0.1.0");
    println!();

    let cli = Cli::parse();
    let mut debugger = init_debugger(cli.command)?;
    run_repl(&mut debugger)?;

    Ok(())
}

/// デバッガを初期化してプロセスにアタッチする
fn init_debugger(command: DebugCommand) -> Result<Debugger> {
    let mut debugger = Debugger::new();

    match command {
        DebugCommand::Attach { pid } => {
            println!("Attaching to process: {}", pid);
            println!();

            debugger.attach(pid)?;
            println!("Attached to process {}", pid);
            println!("Interpreter located, helper exports resolved");
            println!("Set breakpoints and use 'continue' to resume execution");
            println!();
        }
    }

    Ok(debugger)
}

/// REPLループを実行する
fn run_repl(debugger: &mut Debugger) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(tsubaki) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                if let Err(e) = handle_command(debugger, line) {
                    eprintln!("Error: {}", e);
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

fn handle_command(debugger: &mut Debugger, line: &str) -> Result<()> {
    let Some(command) = Command::parse(line) else {
        println!("Unknown command: {}", line);
        println!("Type 'help' for available commands.");
        return Ok(());
    };

    match command {
        Command::Help => println!("{}", Command::help_text()),
        Command::Quit => handle_quit(debugger),
        Command::Break(file, line) => {
            let id = debugger.add_breakpoint(&file, line)?;
            println!("Breakpoint {} set at {}:{}", id, file, line);
        }
        Command::Delete(id) => {
            debugger.remove_breakpoint(id)?;
            println!("Breakpoint {} deleted", id);
        }
        Command::Breakpoints => handle_breakpoint_list(debugger)?,
        Command::Continue => handle_continue(debugger)?,
        Command::StepInto => handle_step(debugger, StepKind::Into)?,
        Command::StepOver => handle_step(debugger, StepKind::Over)?,
        Command::StepOut => handle_step(debugger, StepKind::Out)?,
        Command::CancelStep => {
            debugger.cancel_step()?;
            println!("Step canceled");
        }
        Command::Backtrace => print!("{}", debugger.backtrace()?),
        Command::Locals => print!("{}", debugger.locals()?),
        Command::Print(name) => println!("{}", debugger.print_local(&name)?),
        Command::Set(name, literal) => {
            debugger.set_local(&name, &literal)?;
            println!("{} = {}", name, literal);
        }
        Command::Eval(expression) => {
            let thread = debugger.main_thread()?;
            let result = debugger.evaluate(thread, &expression)?;
            println!("{}", result);
        }
        Command::HexDisplay(enabled) => {
            debugger.options().update(|o| o.hex_display = enabled);
            println!("hex display {}", if enabled { "on" } else { "off" });
        }
        Command::NativeFrames(shown) => {
            debugger.options().update(|o| o.hide_native_frames = !shown);
            println!("native frames {}", if shown { "shown" } else { "hidden" });
        }
    }

    Ok(())
}

/// Quitコマンドを処理する
fn handle_quit(debugger: &mut Debugger) {
    if debugger.is_attached() {
        if let Err(e) = debugger.detach() {
            eprintln!("Error while detaching: {}", e);
        }
    }
    println!("Goodbye!");
    std::process::exit(0);
}

/// Breakpointsコマンドを処理する
fn handle_breakpoint_list(debugger: &mut Debugger) -> Result<()> {
    let breakpoints = debugger.list_breakpoints()?;
    if breakpoints.is_empty() {
        println!("No breakpoints set");
        return Ok(());
    }
    println!("Breakpoints ({}):", breakpoints.len());
    for (id, file, line) in breakpoints {
        println!("  {}. {}:{}", id, file, line);
    }
    Ok(())
}

/// Continueコマンドを処理する
fn handle_continue(debugger: &mut Debugger) -> Result<()> {
    println!("Continuing execution...");

    let stop_reason = debugger.continue_execution()?;

    match stop_reason {
        StopReason::Breakpoint | StopReason::Step => {
            println!();
            for event in debugger.poll_events()? {
                println!("{}", event);
            }
            print!("{}", debugger.backtrace()?);
        }
        StopReason::Signal(signal) => {
            println!();
            println!("Received signal: {:?}", signal);
        }
        StopReason::Exited(code) => {
            println!();
            println!("Process exited with code {}", code);
        }
        StopReason::Other => {
            println!();
            println!("Process stopped (unknown reason)");
        }
    }

    Ok(())
}

/// ステップコマンドを処理する
fn handle_step(debugger: &mut Debugger, kind: StepKind) -> Result<()> {
    let thread = debugger.main_thread()?;
    debugger.begin_step(kind, thread)?;

    let stop_reason = debugger.continue_execution()?;
    match stop_reason {
        StopReason::Exited(code) => {
            println!("Process exited with code {}", code);
            return Ok(());
        }
        StopReason::Signal(signal) => {
            println!("Received signal: {:?}", signal);
        }
        _ => {}
    }

    for event in debugger.poll_events()? {
        println!("{}", event);
    }
    print!("{}", debugger.backtrace()?);

    Ok(())
}
