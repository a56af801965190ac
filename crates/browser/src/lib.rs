pub mod cdp;
pub mod driver;
pub mod launcher;
pub mod login;
pub mod selectors;
pub mod session;

pub use cdp::{CdpClient, CdpEvent};
pub use driver::{CdpDriver, UiDriver};
pub use launcher::{find_browser_binary, BrowserEngine};
pub use login::{FileLoginStore, LoginCredentials, LoginStore, MemoryLoginStore};
pub use selectors::Selector;
pub use session::ServiceSession;
