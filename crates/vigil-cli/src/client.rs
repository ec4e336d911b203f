//! Client-side proxy for the `org.freedesktop.Vigil1` interface.

use zbus::proxy;

#[proxy(
    interface = "org.freedesktop.Vigil1",
    default_service = "org.freedesktop.Vigil1",
    default_path = "/org/freedesktop/Vigil1"
)]
pub trait Vigil {
    fn create_user(&self, username: &str, password: &str, is_admin: bool) -> zbus::Result<String>;

    fn login(&self, username: &str, password: &str) -> zbus::Result<String>;

    fn logout(&self, user_id: i64, session_token: &str) -> zbus::Result<bool>;

    fn change_password(&self, user_id: i64, current: &str, new_password: &str) -> zbus::Result<bool>;

    fn register_face(&self, user_id: i64, image: &[u8]) -> zbus::Result<String>;

    fn verify_face(&self, user_id: i64, image: &[u8]) -> zbus::Result<String>;

    fn generate_backup_code(&self, user_id: i64) -> zbus::Result<String>;

    fn reveal_backup_code(&self, user_id: i64) -> zbus::Result<String>;

    fn verify_backup_code(&self, user_id: i64, code: &str) -> zbus::Result<String>;

    fn unlock_account(&self, user_id: i64) -> zbus::Result<String>;

    fn disable_account(&self, user_id: i64) -> zbus::Result<String>;

    fn enable_account(&self, user_id: i64) -> zbus::Result<String>;

    fn status(&self) -> zbus::Result<String>;
}

/// Connect to the daemon on the bus it runs on (`VIGIL_SESSION_BUS` selects
/// the session bus, as for `vigild`).
pub async fn connect() -> zbus::Result<VigilProxy<'static>> {
    let conn = if std::env::var("VIGIL_SESSION_BUS").is_ok() {
        zbus::Connection::session().await?
    } else {
        zbus::Connection::system().await?
    };
    VigilProxy::new(&conn).await
}
