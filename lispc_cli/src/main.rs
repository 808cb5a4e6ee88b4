use std::{fs, path::PathBuf, process::ExitCode};

use anyhow::Context as _;
use clap::Parser;
use codesnake::{Block, CodeWidth, Label, LineIndex};
use lispc::Diagnostic;
use tracing_subscriber::EnvFilter;
use yansi::Paint;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source file to compile
    input: PathBuf,
    /// Write the assembly to this file instead of standard output
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Execute the program on the built-in machine and print its results
    #[arg(long)]
    run: bool,
}

fn report(path: &str, source: &str, diagnostic: &Diagnostic) {
    eprintln!("{}: {}", "error".red().bold(), diagnostic.error);

    // an empty span has nothing to underline
    if diagnostic.span.is_empty() {
        return;
    }
    let idx = LineIndex::new(source);
    let label = Label::new(diagnostic.span.clone())
        .with_text(diagnostic.error.to_string().red().to_string())
        .with_style(|s| s.red().to_string());
    if let Some(block) = Block::new(&idx, [label]) {
        let block = block.map_code(|c| CodeWidth::new(c, c.len()));
        eprintln!("{}[{path}]", block.prologue());
        eprint!("{block}");
        eprintln!("{}", block.epilogue());
    }
}

fn try_main(args: &Args) -> anyhow::Result<ExitCode> {
    let source = fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read `{}`", args.input.display()))?;

    let asm = match lispc::compile(&source) {
        Ok(asm) => asm,
        Err(diagnostic) => {
            report(&args.input.display().to_string(), &source, &diagnostic);
            return Ok(ExitCode::FAILURE);
        }
    };

    // nothing is written unless the whole program compiled
    match &args.output {
        Some(output) => fs::write(output, asm.to_string())
            .with_context(|| format!("failed to write `{}`", output.display()))?,
        None if !args.run => print!("{asm}"),
        None => {}
    }

    if args.run {
        let printed = lispc::run(&asm).context("the program faulted")?;
        for value in printed {
            println!("{value}");
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    tracing::trace!("CLI args = {:?}", args);

    match try_main(&args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}: {err:#}", "error".red().bold());
            ExitCode::FAILURE
        }
    }
}
