use asmlift::*;

use std::path::PathBuf;

use clap::Parser;

/// Lift machine code into a readable, function-level IR
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Lift functions of an exported program
    Lift {
        /// Path to an exported program: processor, register table, functions and the per-opcode
        /// code generator script
        exported_program: PathBuf,
        /// Address (hex) of the function to lift. Lifts every known function if not provided.
        #[clap(long, parse(try_from_str = parse_hex))]
        function: Option<u64>,
        /// Path to output file for the lifted IR. Printed to stdout if not provided.
        #[clap(long)]
        output: Option<PathBuf>,
        /// Output the control flow graph of each lifted function as a GraphViz `.dot` file to the
        /// given directory
        #[clap(long)]
        debug_output_graphviz: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to select the lifting passes
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<lift_config::CommandLineLiftConfig>,
    },
}

fn parse_hex(s: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn main() {
    let args = Args::parse();

    match args {
        Args::Lift {
            exported_program,
            function,
            output,
            debug_output_graphviz,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let _log_guard = slog_scope::set_global_logger(crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ));

            lift_config::LiftConfig::initialize(advanced_config);

            let name = exported_program
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "lifted".to_string());
            let program = exported::parse(
                &std::fs::read_to_string(&exported_program)
                    .expect("Exported program could not be read"),
                &name,
            )
            .unwrap_or_else(|e| {
                log::crit!("Could not parse exported program"; "error" => %e);
                std::process::exit(1)
            });

            let starts: Vec<ir::Address> = match function {
                Some(addr) => vec![addr],
                None => program.disassembly.functions().map(|f| f.start).collect(),
            };

            let mut session = pipeline::LiftSession::from_exported(program).unwrap_or_else(|e| {
                log::crit!("Could not start lifting session"; "error" => %e);
                std::process::exit(1)
            });
            let lifted = session.translate_all(&starts);

            let listing: String = lifted
                .iter()
                .map(|&f| format!("{:?}", session.module().debug_function(f)))
                .collect::<Vec<_>>()
                .join("\n");

            if let Some(path) = output {
                use std::io::Write;
                write!(std::fs::File::create(path).unwrap(), "{}", listing).unwrap();
            } else {
                println!("{}", listing);
            }

            if let Some(dir) = debug_output_graphviz {
                std::fs::create_dir_all(&dir).unwrap();
                for &f in &lifted {
                    let path = dir.join(format!("{}.dot", session.module().function(f).name));
                    ir_dot::render_function(
                        session.module(),
                        f,
                        &mut std::fs::File::create(path).unwrap(),
                    )
                    .unwrap();
                }
            }

            session.close();
            log::trace!("Done");
        }
    }
}
