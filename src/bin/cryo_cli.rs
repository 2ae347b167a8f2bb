use std::{error::Error, io, process};

use clap::Parser;
use cryo_driver::{Command, Connection, ConnectionOptions, Term, prompt};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server host
    #[arg(long, default_value = cryo_driver::options::DEFAULT_HOST)]
    host: String,
    /// Server port
    #[arg(short, long, default_value_t = cryo_driver::options::DEFAULT_PORT)]
    port: u16,
    /// Database used by terms that do not name one
    #[arg(long)]
    db: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let mut options = ConnectionOptions::new(cli.host, cli.port);
    if let Some(db) = cli.db {
        options = options.with_db(db);
    }

    let connection = Connection::connect(&options)?;
    connection.set_error_handler(|e| eprintln!("connection error: {e}"));

    let interrupted = connection.clone();
    ctrlc::set_handler(move || {
        if let Err(e) = interrupted.close() {
            eprintln!("failed to close connection. error: {e}");
        }
        process::exit(130);
    })?;

    let stdin = io::stdin();
    let stdout = io::stdout();

    loop {
        let writer = StdOut {
            inner: stdout.lock(),
        };

        let cmd = match prompt(stdin.lock(), writer) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match cmd {
            Command::Exit => {
                connection.close()?;
                break;
            }
            Command::Use(db) => connection.use_db(db),
            Command::Query(text) => {
                let cursor = match connection.run(Term::new(text)) {
                    Ok(cursor) => cursor,
                    Err(e) => {
                        eprintln!("failed to run query. error: {e}");
                        break;
                    }
                };

                for item in cursor {
                    match item {
                        Ok(value) => println!("{value}"),
                        Err(e) => eprintln!("query error: {e}"),
                    }
                }
            }
        }
    }

    Ok(())
}

/// StdOut wrapper than automatically flushes content after every write.
struct StdOut<W: io::Write> {
    inner: W,
}

impl<W: io::Write> io::Write for StdOut<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let res = self.inner.write(buf);
        if res.is_ok() {
            self.inner.flush()?
        }
        res
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
