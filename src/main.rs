//! Command-line runner for VM32 program images.
//!
//! # Usage
//! ```text
//! vm32 [options] <image.bin>
//! ```
//!
//! # Options
//! - `-m SIZE`: memory size in KiB (default: 64)
//! - `-d`: debug mode (captures symbols, dumps state after the run)
//! - `-h`: usage

use std::env;
use std::process;
use vm32::machine::program::Image;
use vm32::machine::vm::Vm;
use vm32::utils::log::{self, Level, Logger};

struct Options {
    memory_size: usize,
    debug_mode: bool,
    image_path: String,
}

fn print_usage(program: &str) {
    eprintln!("Usage: {program} [options] <image.bin>");
    eprintln!("Options:");
    eprintln!("  -m SIZE       Set memory size in KiB (default: 64)");
    eprintln!("  -d            Enable debug mode");
    eprintln!("  -h            Show this help message");
}

fn parse_arguments(args: &[String]) -> Result<Options, String> {
    let mut memory_size = 64 * 1024;
    let mut debug_mode = false;
    let mut image_path = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-m" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| "missing memory size value".to_string())?;
                let kib: usize = value
                    .parse()
                    .map_err(|_| format!("invalid memory size '{value}'"))?;
                if kib == 0 {
                    return Err("memory size must be positive".to_string());
                }
                memory_size = kib * 1024;
                i += 1;
            }
            "-d" => debug_mode = true,
            "-h" => return Err(String::new()),
            other if other.starts_with('-') => {
                return Err(format!("unknown option '{other}'"));
            }
            other => {
                if image_path.replace(other.to_string()).is_some() {
                    return Err("multiple image files specified".to_string());
                }
            }
        }
        i += 1;
    }

    let image_path = image_path.ok_or_else(|| "no image file specified".to_string())?;
    Ok(Options {
        memory_size,
        debug_mode,
        image_path,
    })
}

fn main() {
    log::init(Level::Info);
    let args: Vec<String> = env::args().collect();

    let options = match parse_arguments(&args) {
        Ok(options) => options,
        Err(message) => {
            if !message.is_empty() {
                eprintln!("Error: {message}");
            }
            print_usage(&args[0]);
            process::exit(if message.is_empty() { 0 } else { 1 });
        }
    };

    let logger = Logger::new("vm32");

    let bytes = match std::fs::read(&options.image_path) {
        Ok(bytes) => bytes,
        Err(err) => {
            logger.error(&format!("failed to read '{}': {err}", options.image_path));
            process::exit(1);
        }
    };

    let image = match Image::from_bytes(&bytes) {
        Ok(image) => image,
        Err(err) => {
            logger.error(&format!("failed to parse '{}': {err}", options.image_path));
            process::exit(1);
        }
    };

    let mut vm = Vm::new(options.memory_size);
    vm.set_debug_mode(options.debug_mode);
    if let Err(err) = vm.load_image(&image) {
        logger.error(&format!("failed to load image: {err}"));
        process::exit(1);
    }
    logger.info(&format!(
        "loaded '{}' ({} code bytes), starting at 0x{:04X}",
        options.image_path,
        image.code.len(),
        image.code_base
    ));

    match vm.run() {
        Ok(()) => {
            logger.info(&format!(
                "halted after {} instructions",
                vm.instruction_count()
            ));
            if options.debug_mode {
                eprint!("{}", vm.dump_state());
            }
            process::exit(vm.exit_code() as i32);
        }
        Err(_) => {
            if let Some(fault) = vm.last_fault() {
                logger.error(&fault.to_string());
            }
            eprint!("{}", vm.dump_state());
            process::exit(1);
        }
    }
}
