use std::io::{self, Write};
use tether_core::{Config, Paths};

pub async fn run(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();

    if paths.config_file().exists() && !force {
        print!("Config already exists. Overwrite? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    paths.ensure_dirs()?;

    let mut config = Config::default();
    config.browser.context_path = Some(paths.context_file().display().to_string());
    config.save(&paths.config_file())?;
    println!("✓ Created config: {}", paths.config_file().display());

    println!();
    println!("Next steps:");
    println!("  1. Edit {} if the service or browser differ", paths.config_file().display());
    println!("  2. Run `tether status` to verify configuration");
    println!("  3. Run `tether login` to sign in");

    Ok(())
}
