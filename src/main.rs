#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn main() {
    eprintln!("rwatch requires Linux on x86_64 (ptrace and debug registers).");
    std::process::exit(1);
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn main() {
    std::process::exit(linux::run());
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod linux {
    use std::io;
    use std::path::PathBuf;

    use clap::error::ErrorKind;
    use clap::Parser;
    use colored::Colorize;

    use rwatch::config::WatchConfig;
    use rwatch::interrupt;
    use rwatch::logging::{self, LogFormat, LogLevel};
    use rwatch::process::PtraceLauncher;
    use rwatch::symbols::ResolverKind;
    use rwatch::watcher::Watcher;

    #[derive(Parser)]
    #[command(
        name = "rwatch",
        version,
        about = "Report every read and write of a global variable using a hardware watchpoint"
    )]
    struct Cli {
        /// Name of the global variable to watch
        #[arg(long = "var", value_name = "SYMBOL")]
        var: String,

        /// Program to launch
        #[arg(long = "exec", value_name = "PATH")]
        exec: PathBuf,

        /// How to look the symbol up: `nm` or the built-in ELF reader
        #[arg(long, default_value = "nm", value_name = "nm|elf")]
        resolver: ResolverKind,

        /// Fail if the load base of a PIE target cannot be found, instead of
        /// watching the unrelocated address
        #[arg(long)]
        require_load_base: bool,

        /// Diagnostic log level (overridden by RUST_LOG)
        #[arg(long, value_name = "LEVEL")]
        log_level: Option<LogLevel>,

        /// Diagnostic log format: pretty or json (overridden by RWATCH_LOG_FORMAT)
        #[arg(long, value_name = "FORMAT")]
        log_format: Option<LogFormat>,

        /// Arguments passed to the program
        #[arg(last = true)]
        args: Vec<String>,
    }

    impl Cli {
        fn into_config(self) -> WatchConfig {
            WatchConfig {
                symbol: self.var,
                program: self.exec,
                args: self.args,
                resolver: self.resolver,
                require_load_base: self.require_load_base,
            }
        }
    }

    pub fn run() -> i32 {
        let cli = match Cli::try_parse() {
            Ok(cli) => cli,
            Err(e) => {
                let _ = e.print();
                return match e.kind() {
                    ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                    _ => 1,
                };
            }
        };

        if let Err(e) = logging::init_logging(cli.log_level, cli.log_format) {
            eprintln!("{}: {}", "warning".yellow(), e);
        }

        let config = cli.into_config();
        let stop_flag = match interrupt::install() {
            Ok(flag) => flag,
            Err(e) => {
                eprintln!("{}: {}", "error".red(), e);
                return e.exit_code();
            }
        };

        let watcher = Watcher::new(&config, config.resolver, PtraceLauncher, stop_flag);
        let mut out = io::stdout().lock();
        let mut diag = io::stderr().lock();
        match watcher.run(&mut out, &mut diag) {
            Ok(_) => 0,
            Err(e) => {
                drop(diag);
                eprintln!("{}: {}", "error".red(), e);
                e.exit_code()
            }
        }
    }
}
