use std::process::exit;

fn main() {
    match zephyr_cli::run() {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("[error] {err:#}");
            exit(1);
        }
    }
}
