use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;

use evm2_core::Program;
use evm2_frontend::decode;
use evm2_jit::translate;
use evm2_runtime::guest_space::GuestSpace;
use evm2_runtime::sandbox::{self, EXIT_FATAL, EXIT_OK};
use evm2_runtime::thread::GuestThread;
use evm2_runtime::host;

#[derive(Parser)]
#[command(
    name = "evm2",
    about = "Ahead-of-time binary translator and runtime for EVM2 bytecode"
)]
struct Args {
    /// Program image to run
    image: PathBuf,
    /// Payload file backing the file-I/O operations
    payload: Option<PathBuf>,
    /// Run in-process instead of inside a forked sandbox
    #[arg(long)]
    no_sandbox: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let code = if args.no_sandbox {
        run_vm(&args)
    } else {
        sandbox::run_isolated(|| run_vm(&args))
    };
    process::exit(code);
}

fn run_vm(args: &Args) -> i32 {
    let program = match Program::load(&args.image) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("error: cannot load {}: {err}", args.image.display());
            return EXIT_FATAL;
        }
    };

    let insns = decode(program.code());
    log::debug!("decoded {} instructions", insns.len());

    let iface = host::interface();
    let translated = match translate(&insns, &iface) {
        Ok(translated) => translated,
        Err(err) => {
            eprintln!("error: translation failed: {err}");
            return EXIT_FATAL;
        }
    };
    log::debug!("translated to {} native words", translated.words().len());

    let image = match translated.finalize() {
        Ok(image) => image,
        Err(err) => {
            eprintln!("error: cannot map translated code: {err}");
            return EXIT_FATAL;
        }
    };

    let memory = match GuestSpace::new(program.data_size() as usize) {
        Ok(memory) => memory,
        Err(err) => {
            eprintln!("error: cannot reserve guest memory: {err}");
            return EXIT_FATAL;
        }
    };
    memory.load_initial(program.initial_data());

    if let Some(payload) = &args.payload {
        host::set_payload_path(payload);
    }
    sandbox::install_fault_handler();

    let main_thread = match GuestThread::spawn(
        Arc::new(memory),
        Arc::new(image),
        0,
        [0; 16],
    ) {
        Ok(thread) => thread,
        Err(err) => {
            eprintln!("error: cannot start guest thread: {err}");
            return EXIT_FATAL;
        }
    };
    main_thread.join();
    EXIT_OK
}
