pub mod login;
pub mod onboard;
pub mod request;
pub mod status;
pub mod watch;

use anyhow::Context;
use std::io::{self, Write};
use std::sync::Arc;
use tether_browser::{CdpDriver, FileLoginStore, LoginStore, ServiceSession};
use tether_core::{Config, Paths};

/// A launched browser with a started session on top of it.
pub struct Live {
    pub session: ServiceSession,
    pub login_store: Arc<FileLoginStore>,
    driver: Arc<CdpDriver>,
}

impl Live {
    pub async fn open() -> anyhow::Result<Self> {
        let paths = Paths::new();
        paths.ensure_dirs()?;
        let config = Config::load_or_default(&paths)?;

        let profile_dir = paths.profile_dir(&config.browser.profile);
        let driver = Arc::new(
            CdpDriver::launch(&config.browser, &profile_dir)
                .await
                .context("failed to start the browser")?,
        );
        let login_store = Arc::new(FileLoginStore::new(paths.login_file()));
        let session = ServiceSession::start(driver.clone(), config, login_store.clone()).await?;

        Ok(Self {
            session,
            login_store,
            driver,
        })
    }

    /// Log in with the saved username and password unless the restored
    /// context is still authenticated.
    pub async fn ensure_logged_in(&self) -> anyhow::Result<()> {
        self.session.open_login_page().await?;
        let credentials = self
            .login_store
            .load()
            .await
            .context("no saved login; run `tether login` first")?;
        self.session
            .login(&credentials.username, &credentials.password)
            .await?;
        Ok(())
    }

    pub async fn shutdown(self) {
        self.session.close();
        self.driver.close().await;
    }
}

pub fn prompt(label: &str) -> anyhow::Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
