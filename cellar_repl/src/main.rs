use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use anyhow::Context;
use cellar::{
    compile_source, open_lib,
    runtime::chunk,
    ClosureTemplate, Error, ParseError, Value, Vm,
};
use clap::Parser;
use codesnake::{Block, CodeWidth, Label, LineIndex};
use yansi::Paint;

/// Compile and run programs for the cellar register VM
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Program to run; starts an interactive session when absent
    file: Option<PathBuf>,
    /// Print the compiled templates instead of running them
    #[arg(long)]
    disassemble: bool,
    /// Write the compiled program as a binary chunk to this path
    #[arg(long, value_name = "PATH")]
    emit: Option<PathBuf>,
    /// Treat FILE as a binary chunk rather than source text
    #[arg(long, requires = "file")]
    chunk: bool,
}

fn make_block<'a>(idx: &'a LineIndex, err: &ParseError) -> Option<Block<&'a str, String>> {
    let mut span = err.span();
    // end-of-input errors point just past the text; label the last character
    if span.is_empty() {
        span.start = span.start.saturating_sub(1);
    }
    Block::new(
        idx,
        [Label::new(span)
            .with_text(err.to_string().red().to_string())
            .with_style(|s| s.red().to_string())],
    )
}

fn report_parse_error(name: &str, src: &str, err: &ParseError) {
    let idx = LineIndex::new(src);
    match make_block(&idx, err) {
        Some(block) => {
            let block = block.map_code(|c| CodeWidth::new(c, c.len()));
            eprintln!("{}[{name}]", block.prologue());
            eprint!("{block}");
            eprintln!("{}", block.epilogue());
        }
        None => eprintln!("{}", err.red()),
    }
}

fn load_program(args: &Args, path: &Path) -> anyhow::Result<ClosureTemplate> {
    if args.chunk {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        return Ok(chunk::load(BufReader::new(file))?);
    }

    let src = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    match compile_source(&src) {
        Err(Error::Parse(err)) => {
            report_parse_error(&path.display().to_string(), &src, &err);
            Err(Error::Parse(err).into())
        }
        result => Ok(result?),
    }
}

fn run_file(args: &Args, path: &Path) -> anyhow::Result<()> {
    let mut program = load_program(args, path)?;

    if let Some(out) = &args.emit {
        let file = File::create(out).with_context(|| format!("creating {}", out.display()))?;
        chunk::dump(&program, BufWriter::new(file))
            .with_context(|| format!("writing {}", out.display()))?;
        log::info!("wrote chunk to {}", out.display());
    }
    if args.disassemble {
        print!("{}", program.disassemble());
        return Ok(());
    }
    if args.emit.is_some() {
        return Ok(());
    }

    let mut vm = Vm::new();
    open_lib(&mut vm);
    vm.bootstrap(&mut program)?;
    let value = vm.run()?;
    if !value.is_unspecified() {
        println!("{value}");
    }
    log::debug!("{:?}", vm.stats());
    Ok(())
}

fn print_result(value: &Value) {
    if value.is_unspecified() {
        return;
    }
    println!("{} {}", "=>".dim(), value.green());
}

fn repl(args: &Args) -> anyhow::Result<()> {
    let mut readline = rustyline::DefaultEditor::new()?;
    let mut vm = Vm::new();
    open_lib(&mut vm);

    while let Ok(input) = readline.readline(">> ") {
        let src = input.as_str();
        if src.trim().is_empty() {
            continue;
        }
        _ = readline.add_history_entry(src);

        let mut program = match compile_source(src) {
            Ok(program) => program,
            Err(Error::Parse(err)) => {
                report_parse_error("repl", src, &err);
                continue;
            }
            Err(err) => {
                eprintln!("{}", err.red());
                continue;
            }
        };
        if args.disassemble {
            print!("{}", program.disassemble());
            continue;
        }

        // a failed run leaves the vm mid-activation; the next bootstrap
        // discards it and keeps the globals
        let result = vm.bootstrap(&mut program).and_then(|()| vm.run());
        match result {
            Ok(value) => print_result(&value),
            Err(err) => eprintln!("{}", err.red()),
        }
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    match &args.file {
        Some(path) => run_file(&args, path),
        None => repl(&args),
    }
}
