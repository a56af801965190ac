use tether_browser::{find_browser_binary, BrowserEngine, FileLoginStore, LoginStore};
use tether_core::{Config, Paths};

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!("tether status");
    println!("=============");
    println!();

    let config_path = paths.config_file();
    let config_exists = config_path.exists();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_exists { "✓" } else { "✗ (not found)" }
    );

    if !config_exists {
        println!();
        println!("Run `tether onboard` to initialize.");
        return Ok(());
    }

    let config = Config::load(&config_path)?;

    println!("Service:   {}", config.service.origin());
    println!("Login:     {}", config.service.login_url());
    println!();

    println!("Tracked routes:");
    let routes = &config.service.routes;
    for (slice, path) in [
        ("session", &routes.session),
        ("catalog", &routes.catalog),
        ("account", &routes.account),
        ("history", &routes.history),
    ] {
        println!("  {:<8} {}", slice, config.service.url(path));
    }
    println!();

    match &config.network.proxy {
        Some(proxy) => println!("Proxy:     {} (bypass: {})", proxy, config.network.no_proxy.join(", ")),
        None => println!("Proxy:     none"),
    }

    let engine = BrowserEngine::parse(&config.browser.engine);
    match find_browser_binary(engine) {
        Some(path) => println!("Browser:   {} ✓ {}", engine.name(), path),
        None => println!("Browser:   {} ✗ (not found)", engine.name()),
    }
    match config.browser.context_path() {
        Some(path) => println!(
            "Context:   {} {}",
            path.display(),
            if path.exists() { "✓" } else { "(not saved yet)" }
        ),
        None => println!("Context:   not persisted"),
    }

    let login = FileLoginStore::new(paths.login_file());
    match login.load().await {
        Ok(credentials) => println!("Account:   {} ✓", credentials.username),
        Err(_) => println!("Account:   ✗ (run `tether login`)"),
    }

    Ok(())
}
