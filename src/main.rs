fn main() {
    if handle_cli_flags() {
        return;
    }

    if let Err(err) = mural::run() {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn handle_cli_flags() -> bool {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut index = 0;
    let mut saw_flag = false;
    while index < args.len() {
        match args[index].as_str() {
            "--version" | "-V" => {
                println!("Mural {}", mural::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!(
                    "Mural — realtime admin-curated video feed.\n\n  --version, -V                   Show version and exit\n  --help,    -h                   Show this help message\n  --connect <project> <api-key>   Save backend credentials and exit"
                );
                saw_flag = true;
            }
            "--connect" => {
                saw_flag = true;
                let project = args.get(index + 1).cloned().unwrap_or_default();
                let api_key = args.get(index + 2).cloned().unwrap_or_default();
                index += 2;
                match mural::config::save_backend_credentials(None, &project, &api_key) {
                    Ok(path) => println!("Credentials saved to {}", path.display()),
                    Err(err) => {
                        eprintln!("Failed to save credentials: {err:?}");
                        std::process::exit(1);
                    }
                }
            }
            _ => {}
        }
        index += 1;
    }
    saw_flag
}
