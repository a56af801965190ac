//! The service session: a browser logged in to the service, the state its
//! own traffic reveals, and a transport that borrows its cookies.
//!
//! The session is also the vault's regeneration callback. When a cookie
//! expires it drops the persisted browsing context, replays the login with
//! the saved username and password, and hands back the fresh cookies.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tether_core::{Config, CredentialSet, Error, Lifecycle, LifecycleEvent, Result};
use tether_net::{CredentialRegenerator, CredentialVault, Transport};
use tether_state::{RouteTable, StateStore, TrafficObserver};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::driver::UiDriver;
use crate::login::{LoginCredentials, LoginStore};
use crate::selectors::{
    CONTINUE_BUTTON, DIALOG, DIALOG_DONE, DIALOG_NEXT, EMAIL_INPUT, LOGIN_BUTTON, NEW_CHAT_BUTTON,
    PASSWORD_INPUT,
};

const DIALOG_WAIT: Duration = Duration::from_secs(10);

pub struct ServiceSession {
    inner: Arc<Inner>,
}

struct Inner {
    driver: Arc<dyn UiDriver>,
    config: Config,
    login_store: Arc<dyn LoginStore>,
    store: Arc<StateStore>,
    lifecycle: Mutex<Lifecycle>,
    transport: Mutex<Option<Arc<Transport>>>,
    login_lock: tokio::sync::Mutex<()>,
    observer: Mutex<Option<JoinHandle<()>>>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
}

impl ServiceSession {
    /// Restore the persisted browsing context if there is one, start
    /// feeding the driver's traffic into a fresh store, and open the
    /// service.
    pub async fn start(
        driver: Arc<dyn UiDriver>,
        config: Config,
        login_store: Arc<dyn LoginStore>,
    ) -> Result<Self> {
        if let Some(path) = config.browser.context_path() {
            if path.exists() {
                driver.load_context(&path).await?;
            }
        }

        let store = Arc::new(StateStore::new());
        let feed = driver.traffic()?;
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let observer = TrafficObserver::new(RouteTable::from_config(&config.service), store.clone());
        let observer = tokio::spawn(observer.run(feed, Some(errors_tx)));

        driver.navigate(config.service.origin()).await?;

        Ok(Self {
            inner: Arc::new(Inner {
                driver,
                config,
                login_store,
                store,
                lifecycle: Mutex::new(Lifecycle::Anonymous),
                transport: Mutex::new(None),
                login_lock: tokio::sync::Mutex::new(()),
                observer: Mutex::new(Some(observer)),
                errors: Mutex::new(Some(errors_rx)),
            }),
        })
    }

    pub fn store(&self) -> Arc<StateStore> {
        self.inner.store.clone()
    }

    pub fn driver(&self) -> &Arc<dyn UiDriver> {
        &self.inner.driver
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.inner.lifecycle)
    }

    /// Errors from matched routes whose body failed to load or parse.
    /// Can be taken once.
    pub fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        lock(&self.inner.errors).take()
    }

    pub fn transport(&self) -> Result<Arc<Transport>> {
        lock(&self.inner.transport)
            .clone()
            .ok_or_else(|| Error::Programming("not logged in; call login first".to_string()))
    }

    pub fn regenerator(&self) -> Arc<dyn CredentialRegenerator> {
        Arc::new(SessionRegenerator {
            inner: Arc::downgrade(&self.inner),
        })
    }

    pub async fn open_login_page(&self) -> Result<()> {
        self.inner
            .driver
            .navigate(&self.inner.config.service.login_url())
            .await
    }

    pub async fn is_logged_in(&self) -> bool {
        self.inner.is_logged_in().await
    }

    /// Log in through the page's own form. The driver must be on the login
    /// page, unless it is already showing an authenticated page.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        self.inner
            .login(LoginCredentials::new(username, password))
            .await
            .map(|_| ())
    }

    /// Leave `AuthFailed` so another login may be attempted.
    pub fn retry(&self) -> Result<Lifecycle> {
        self.inner.advance(LifecycleEvent::Retry)
    }

    pub fn close(&self) {
        if let Some(handle) = lock(&self.inner.observer).take() {
            handle.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.observer.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

impl Inner {
    fn advance(&self, event: LifecycleEvent) -> Result<Lifecycle> {
        let mut state = lock(&self.lifecycle);
        let next = state.transition(event)?;
        if next != *state {
            info!(from = %*state, to = %next, "Lifecycle transition");
        }
        *state = next;
        Ok(next)
    }

    fn context_path(&self) -> Option<PathBuf> {
        self.config.browser.context_path()
    }

    async fn on_login_page(&self) -> Result<bool> {
        let url = self.driver.current_url().await?;
        let page = url.split(['?', '#']).next().unwrap_or("");
        Ok(page == self.config.service.login_url())
    }

    async fn is_logged_in(&self) -> bool {
        let Ok(url) = self.driver.current_url().await else {
            return false;
        };
        let on_service = url
            .strip_prefix(self.config.service.origin())
            .map(|rest| {
                (rest.is_empty() || rest.starts_with(['/', '?', '#'])) && !rest.starts_with("/auth")
            })
            .unwrap_or(false);
        on_service && self.driver.exists(NEW_CHAT_BUTTON).await.unwrap_or(false)
    }

    async fn login(self: &Arc<Self>, credentials: LoginCredentials) -> Result<CredentialSet> {
        let _guard = self.login_lock.lock().await;

        if !self.on_login_page().await? {
            if !self.is_logged_in().await {
                let url = self.driver.current_url().await.unwrap_or_default();
                return Err(Error::Programming(format!(
                    "log in from the login page ({}), not {}",
                    self.config.service.login_url(),
                    url
                )));
            }
            info!("Already logged in, skipping the login form");
            self.advance(LifecycleEvent::LoginStarted)?;
            return self.finish_login().await;
        }

        self.advance(LifecycleEvent::LoginStarted)?;
        self.submit(&credentials).await
    }

    /// Drive the form from `Authenticating`. A failure that leaves the page
    /// unauthenticated moves the lifecycle to `AuthFailed`.
    async fn submit(self: &Arc<Self>, credentials: &LoginCredentials) -> Result<CredentialSet> {
        if let Err(e) = self.run_login_steps(credentials).await {
            if !self.is_logged_in().await {
                warn!(error = %e, "Login failed");
                self.advance(LifecycleEvent::LoginFailed)?;
                return Err(e);
            }
            info!(error = %e, "Login step failed on an authenticated page, treating as logged in");
        }
        self.finish_login().await
    }

    async fn run_login_steps(&self, credentials: &LoginCredentials) -> Result<()> {
        info!(username = %credentials.username, "Submitting login form");
        self.driver.click(LOGIN_BUTTON).await?;
        self.driver.fill(EMAIL_INPUT, &credentials.username).await?;
        self.driver.click(CONTINUE_BUTTON).await?;
        self.driver.fill(PASSWORD_INPUT, &credentials.password).await?;
        self.driver.click(CONTINUE_BUTTON).await?;
        self.pass_dialog().await?;
        if let Some(path) = self.context_path() {
            self.driver.save_context(&path).await?;
        }
        self.login_store.save(credentials).await
    }

    /// Click through the onboarding dialog, at most `dialog_max_steps`
    /// times, then close it.
    async fn pass_dialog(&self) -> Result<()> {
        if !self.driver.wait_for(DIALOG, DIALOG_WAIT).await? {
            debug!("No onboarding dialog");
            return Ok(());
        }
        let max_steps = self.config.browser.dialog_max_steps;
        let mut steps = 0;
        while self.driver.exists(DIALOG_NEXT).await? {
            if steps >= max_steps {
                return Err(Error::Browser(format!(
                    "onboarding dialog still offers 'Next' after {} steps",
                    max_steps
                )));
            }
            self.driver.click(DIALOG_NEXT).await?;
            steps += 1;
        }
        if self.driver.exists(DIALOG_DONE).await? {
            self.driver.click(DIALOG_DONE).await?;
        }
        debug!(steps, "Onboarding dialog dismissed");
        Ok(())
    }

    async fn finish_login(self: &Arc<Self>) -> Result<CredentialSet> {
        let installed = match self.driver.cookies().await {
            Ok(cookies) => self.install(cookies),
            Err(e) => Err(e),
        };
        match installed {
            Ok(cookies) => {
                self.advance(LifecycleEvent::LoginSucceeded)?;
                info!(cookies = cookies.len(), "Logged in");
                Ok(cookies)
            }
            Err(e) => {
                self.advance(LifecycleEvent::LoginFailed)?;
                Err(e)
            }
        }
    }

    /// Hand fresh cookies to the transport, creating it on first login.
    fn install(self: &Arc<Self>, cookies: CredentialSet) -> Result<CredentialSet> {
        let mut transport = lock(&self.transport);
        match transport.as_ref() {
            Some(existing) => existing.vault().replace(cookies.clone()),
            None => {
                let regenerator = Arc::new(SessionRegenerator {
                    inner: Arc::downgrade(self),
                });
                let vault = CredentialVault::new(cookies.clone(), regenerator);
                let built = Transport::from_config(
                    &self.config.network,
                    self.config.service.origin(),
                    vault,
                )?;
                *transport = Some(Arc::new(built));
            }
        }
        Ok(cookies)
    }

    async fn regenerate(self: &Arc<Self>) -> Result<CredentialSet> {
        let _guard = self.login_lock.lock().await;

        let state = *lock(&self.lifecycle);
        if state.is_terminal() {
            return Err(Error::Regeneration(
                "last login failed; retry before refreshing credentials".to_string(),
            ));
        }
        if state == Lifecycle::Authenticated {
            self.advance(LifecycleEvent::ExpiryDetected)?;
        }
        self.advance(LifecycleEvent::LoginStarted)?;

        let result = self.replay_login().await;
        if let Err(e) = &result {
            // Steps before the form do not record their own failure.
            if *lock(&self.lifecycle) == Lifecycle::Authenticating {
                warn!(error = %e, "Credential regeneration failed");
                self.advance(LifecycleEvent::LoginFailed)?;
            }
        }
        result
    }

    async fn replay_login(self: &Arc<Self>) -> Result<CredentialSet> {
        if let Some(path) = self.context_path() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed stale browsing context"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let credentials = self.login_store.load().await?;
        self.driver.navigate(&self.config.service.login_url()).await?;
        if !self.on_login_page().await? {
            if self.is_logged_in().await {
                return self.finish_login().await;
            }
            let url = self.driver.current_url().await.unwrap_or_default();
            return Err(Error::Browser(format!("login page did not open, at {}", url)));
        }
        self.submit(&credentials).await
    }
}

struct SessionRegenerator {
    inner: Weak<Inner>,
}

#[async_trait]
impl CredentialRegenerator for SessionRegenerator {
    async fn regenerate(&self) -> Result<CredentialSet> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| Error::Regeneration("service session closed".to_string()))?;
        inner.regenerate().await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::login::MemoryLoginStore;
    use crate::selectors::Selector;
    use futures::FutureExt;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};
    use tether_core::{BodyLoader, Credential, Exchange, NEVER_EXPIRES};
    use tether_state::EventKind;

    const ORIGIN: &str = "https://x.test";

    #[derive(Default)]
    struct Page {
        url: String,
        logins: u32,
        continues: u32,
        dialog_open: bool,
        dialog_next: u32,
        redirect_on_fill: bool,
        filled: Vec<(Selector, String)>,
        clicks: Vec<Selector>,
        loaded: Vec<PathBuf>,
    }

    /// Scripted stand-in for a browser showing the service's login flow.
    struct FakeDriver {
        dialog_steps: u32,
        page: Mutex<Page>,
        traffic: Mutex<Option<mpsc::Receiver<Exchange>>>,
    }

    impl FakeDriver {
        fn new(dialog_steps: u32) -> (Arc<Self>, mpsc::Sender<Exchange>) {
            let (tx, rx) = mpsc::channel(16);
            let driver = Arc::new(Self {
                dialog_steps,
                page: Mutex::new(Page::default()),
                traffic: Mutex::new(Some(rx)),
            });
            (driver, tx)
        }

        fn page(&self) -> std::sync::MutexGuard<'_, Page> {
            self.page.lock().unwrap()
        }

        fn authenticated(page: &Page) -> bool {
            page.logins > 0
                && !page.dialog_open
                && page.url.starts_with(ORIGIN)
                && !page.url.contains("/auth")
        }
    }

    #[async_trait]
    impl UiDriver for FakeDriver {
        async fn navigate(&self, url: &str) -> Result<()> {
            self.page().url = url.to_string();
            Ok(())
        }

        async fn current_url(&self) -> Result<String> {
            Ok(self.page().url.clone())
        }

        async fn fill(&self, selector: Selector, text: &str) -> Result<()> {
            let mut page = self.page();
            if page.redirect_on_fill {
                page.url = format!("{}/", ORIGIN);
                return Err(Error::Timeout(format!("element {} did not appear", selector)));
            }
            page.filled.push((selector, text.to_string()));
            Ok(())
        }

        async fn click(&self, selector: Selector) -> Result<()> {
            let mut page = self.page();
            page.clicks.push(selector);
            if selector == CONTINUE_BUTTON {
                page.continues += 1;
                if page.continues % 2 == 0 {
                    page.logins += 1;
                    page.url = format!("{}/", ORIGIN);
                    page.dialog_open = true;
                    page.dialog_next = self.dialog_steps;
                }
            } else if selector == DIALOG_NEXT {
                if page.dialog_next != u32::MAX {
                    page.dialog_next -= 1;
                }
            } else if selector == DIALOG_DONE {
                page.dialog_open = false;
            }
            Ok(())
        }

        async fn exists(&self, selector: Selector) -> Result<bool> {
            let page = self.page();
            Ok(match selector {
                s if s == DIALOG || s == DIALOG_DONE => page.dialog_open,
                s if s == DIALOG_NEXT => page.dialog_open && page.dialog_next > 0,
                s if s == NEW_CHAT_BUTTON => Self::authenticated(&page),
                _ => true,
            })
        }

        async fn wait_for(&self, selector: Selector, _timeout: Duration) -> Result<bool> {
            self.exists(selector).await
        }

        async fn cookies(&self) -> Result<CredentialSet> {
            let value = format!("gen-{}", self.page().logins);
            Ok(CredentialSet::new(vec![Credential::new(
                "sid",
                &value,
                ".x.test",
                "/",
                NEVER_EXPIRES,
            )]))
        }

        async fn save_context(&self, path: &Path) -> Result<()> {
            std::fs::write(path, "[]")?;
            Ok(())
        }

        async fn load_context(&self, path: &Path) -> Result<()> {
            self.page().loaded.push(path.to_path_buf());
            Ok(())
        }

        fn traffic(&self) -> Result<mpsc::Receiver<Exchange>> {
            self.traffic
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::Programming("traffic feed already taken".to_string()))
        }
    }

    fn config(dir: &TempDir, dialog_max_steps: u32) -> Config {
        let mut config = Config::default();
        config.service.origin = ORIGIN.to_string();
        config.browser.dialog_max_steps = dialog_max_steps;
        config.browser.context_path = Some(dir.path().join("context.json").display().to_string());
        config
    }

    async fn started(
        dialog_steps: u32,
        dialog_max_steps: u32,
    ) -> (ServiceSession, Arc<FakeDriver>, Arc<MemoryLoginStore>, mpsc::Sender<Exchange>, TempDir) {
        let dir = tempdir().unwrap();
        let (driver, feed) = FakeDriver::new(dialog_steps);
        let logins = Arc::new(MemoryLoginStore::new());
        let session = ServiceSession::start(driver.clone(), config(&dir, dialog_max_steps), logins.clone())
            .await
            .unwrap();
        (session, driver, logins, feed, dir)
    }

    #[tokio::test]
    async fn test_login_walks_form_and_dialog() {
        let (session, driver, logins, _feed, dir) = started(2, 5).await;
        assert_eq!(driver.page().url, ORIGIN);
        assert!(matches!(session.transport(), Err(Error::Programming(_))));

        session.open_login_page().await.unwrap();
        session.login("me@x.test", "pw").await.unwrap();

        assert_eq!(session.lifecycle(), Lifecycle::Authenticated);
        {
            let page = driver.page();
            assert_eq!(
                page.filled,
                vec![(EMAIL_INPUT, "me@x.test".to_string()), (PASSWORD_INPUT, "pw".to_string())]
            );
            assert_eq!(page.clicks.first(), Some(&LOGIN_BUTTON));
            assert_eq!(page.clicks.iter().filter(|s| **s == DIALOG_NEXT).count(), 2);
            assert_eq!(page.clicks.last(), Some(&DIALOG_DONE));
        }
        assert!(dir.path().join("context.json").exists());
        assert_eq!(logins.load().await.unwrap(), LoginCredentials::new("me@x.test", "pw"));

        let transport = session.transport().unwrap();
        assert_eq!(transport.vault().credentials().header_value(), "sid=gen-1");
    }

    #[tokio::test]
    async fn test_login_off_the_login_page_is_a_programming_error() {
        let (session, _driver, _logins, _feed, _dir) = started(0, 5).await;
        let err = session.login("me", "pw").await.unwrap_err();
        assert!(matches!(err, Error::Programming(_)));
        assert_eq!(session.lifecycle(), Lifecycle::Anonymous);
    }

    #[tokio::test]
    async fn test_endless_dialog_is_bounded() {
        let (session, driver, logins, _feed, _dir) = started(u32::MAX, 3).await;
        session.open_login_page().await.unwrap();

        let err = session.login("me", "pw").await.unwrap_err();
        assert!(matches!(err, Error::Browser(_)));
        assert_eq!(driver.page().clicks.iter().filter(|s| **s == DIALOG_NEXT).count(), 3);
        assert_eq!(session.lifecycle(), Lifecycle::AuthFailed);
        assert!(logins.load().await.is_err());

        session.open_login_page().await.unwrap();
        assert!(matches!(session.login("me", "pw").await, Err(Error::Programming(_))));
        assert_eq!(session.retry().unwrap(), Lifecycle::Anonymous);
    }

    #[tokio::test]
    async fn test_failed_step_on_authenticated_page_counts_as_login() {
        let (session, driver, logins, _feed, _dir) = started(0, 5).await;
        session.open_login_page().await.unwrap();
        {
            let mut page = driver.page();
            page.logins = 1;
            page.redirect_on_fill = true;
        }

        session.login("me", "pw").await.unwrap();
        assert_eq!(session.lifecycle(), Lifecycle::Authenticated);
        assert!(session.transport().is_ok());
        assert!(matches!(logins.load().await, Err(Error::CredentialMissing(_))));
    }

    #[tokio::test]
    async fn test_regeneration_logs_in_again() {
        let (session, driver, _logins, _feed, dir) = started(1, 5).await;
        session.open_login_page().await.unwrap();
        session.login("me", "pw").await.unwrap();

        let fresh = session.regenerator().regenerate().await.unwrap();

        assert_eq!(fresh.header_value(), "sid=gen-2");
        assert_eq!(driver.page().logins, 2);
        assert_eq!(driver.page().clicks.iter().filter(|s| **s == LOGIN_BUTTON).count(), 2);
        assert_eq!(session.lifecycle(), Lifecycle::Authenticated);
        assert!(dir.path().join("context.json").exists());
        assert_eq!(session.transport().unwrap().vault().credentials().header_value(), "sid=gen-2");
    }

    #[tokio::test]
    async fn test_regeneration_without_saved_login() {
        let (session, _driver, _logins, _feed, _dir) = started(0, 5).await;
        let err = session.regenerator().regenerate().await.unwrap_err();
        assert!(matches!(err, Error::CredentialMissing(_)));
        assert_eq!(session.lifecycle(), Lifecycle::AuthFailed);
    }

    #[tokio::test]
    async fn test_failed_regeneration_after_login_is_terminal_until_retry() {
        let (session, driver, _logins, _feed, _dir) = started(0, 5).await;
        {
            let mut page = driver.page();
            page.url = format!("{}/", ORIGIN);
            page.logins = 1;
        }
        session.login("me", "pw").await.unwrap();
        assert_eq!(session.lifecycle(), Lifecycle::Authenticated);

        let regenerator = session.regenerator();
        let err = regenerator.regenerate().await.unwrap_err();
        assert!(matches!(err, Error::CredentialMissing(_)));
        assert_eq!(session.lifecycle(), Lifecycle::AuthFailed);

        let url = driver.page().url.clone();
        assert!(matches!(regenerator.regenerate().await, Err(Error::Regeneration(_))));
        assert_eq!(driver.page().url, url);

        assert_eq!(session.retry().unwrap(), Lifecycle::Anonymous);
    }

    #[tokio::test]
    async fn test_start_restores_saved_context() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("context.json");
        std::fs::write(&path, "[]").unwrap();
        let (driver, _feed) = FakeDriver::new(0);

        let _session = ServiceSession::start(driver.clone(), config(&dir, 5), Arc::new(MemoryLoginStore::new()))
            .await
            .unwrap();
        assert_eq!(driver.page().loaded, vec![path]);
    }

    #[tokio::test]
    async fn test_observed_traffic_reaches_store() {
        let (session, _driver, _logins, feed, _dir) = started(0, 5).await;
        let store = session.store();
        let (_id, mut events) = store.notifier().subscribe_channel(EventKind::SessionUpdated);

        let body: BodyLoader = async { Ok(br#"{"accessToken": "tok"}"#.to_vec()) }.boxed();
        feed.send(Exchange::new(
            &format!("{}/api/auth/session", ORIGIN),
            [("Content-Type", "application/json")],
            body,
        ))
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind(), EventKind::SessionUpdated);
        assert_eq!(store.get_session().unwrap().access_token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn test_bad_body_on_matched_route_surfaces_as_error() {
        let (session, _driver, _logins, feed, _dir) = started(0, 5).await;
        let mut errors = session.take_errors().unwrap();
        assert!(session.take_errors().is_none());

        let body: BodyLoader = async { Ok(b"not json".to_vec()) }.boxed();
        feed.send(Exchange::new(
            &format!("{}/backend-api/models", ORIGIN),
            [("content-type", "application/json")],
            body,
        ))
        .await
        .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, Error::Parse(_)));
    }
}
