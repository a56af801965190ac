use super::{prompt, Live};

pub async fn run(username: Option<String>) -> anyhow::Result<()> {
    let username = match username {
        Some(u) => u,
        None => prompt("Username")?,
    };
    let password = prompt("Password")?;
    if username.is_empty() || password.is_empty() {
        anyhow::bail!("username and password are required");
    }

    let live = Live::open().await?;
    live.session.open_login_page().await?;
    let result = live.session.login(&username, &password).await;
    let lifecycle = live.session.lifecycle();
    live.shutdown().await;

    result?;
    println!("✓ Logged in as {} ({})", username, lifecycle);
    Ok(())
}
