use std::sync::Arc;

use serde::Serialize;
use zbus::interface;

use crate::service::{AuthError, AuthService, BackupCodeReply, RegistrationReply, VerifyFaceReply};

/// D-Bus interface for the Vigil authentication daemon.
///
/// Bus name: org.freedesktop.Vigil1
/// Object path: /org/freedesktop/Vigil1
///
/// Security: on the system bus every method except `Status` is restricted
/// to root callers (login frontends and administration tools). On the
/// session bus (development mode) caller checks are skipped.
pub struct VigilService {
    pub service: Arc<AuthService>,
    pub session_bus: bool,
}

/// Retrieve the UID of the D-Bus peer identified by `sender_str` (a unique bus name).
async fn get_caller_uid(sender_str: &str, conn: &zbus::Connection) -> zbus::fdo::Result<u32> {
    let dbus_proxy = zbus::fdo::DBusProxy::new(conn)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    let bus_name = zbus::names::BusName::try_from(sender_str)
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    dbus_proxy
        .get_connection_unix_user(bus_name)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Methods any local caller may invoke on the system bus. `Status` reports
/// only aggregate counts and the active policy.
const PUBLIC_METHODS: &[&str] = &["Status"];

fn caller_permitted(method: &str, caller_uid: u32) -> bool {
    caller_uid == 0 || PUBLIC_METHODS.contains(&method)
}

fn failed(e: AuthError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.public_message())
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

impl VigilService {
    async fn authorize(
        &self,
        method: &str,
        header: &zbus::message::Header<'_>,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        if self.session_bus {
            return Ok(());
        }
        let sender = header
            .sender()
            .ok_or_else(|| zbus::fdo::Error::Failed("no sender in message".to_string()))?;
        let caller_uid = get_caller_uid(sender.as_str(), conn).await?;
        if !caller_permitted(method, caller_uid) {
            tracing::warn!(method, caller_uid, "rejected non-root caller");
            return Err(zbus::fdo::Error::AccessDenied(format!(
                "{method} requires root on the system bus"
            )));
        }
        Ok(())
    }
}

#[interface(name = "org.freedesktop.Vigil1")]
impl VigilService {
    /// Create a user. Returns `{"user_id": n}`.
    async fn create_user(
        &self,
        username: &str,
        password: &str,
        is_admin: bool,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize("CreateUser", &header, conn).await?;
        let user_id = self
            .service
            .create_user(username, password, is_admin)
            .await
            .map_err(failed)?;
        to_json(&serde_json::json!({ "user_id": user_id }))
    }

    /// Password step. Returns the session token and the next step as JSON.
    async fn login(
        &self,
        username: &str,
        password: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize("Login", &header, conn).await?;
        tracing::info!(username, "login requested");
        let outcome = self.service.login(username, password).await.map_err(failed)?;
        to_json(&outcome)
    }

    async fn logout(
        &self,
        user_id: i64,
        session_token: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        self.authorize("Logout", &header, conn).await?;
        self.service.logout(user_id, session_token).await.map_err(failed)
    }

    async fn change_password(
        &self,
        user_id: i64,
        current: &str,
        new_password: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        self.authorize("ChangePassword", &header, conn).await?;
        self.service
            .change_password(user_id, current, new_password)
            .await
            .map_err(failed)?;
        Ok(true)
    }

    /// Register a face from an image payload (raw bytes, base64 or data URI).
    async fn register_face(
        &self,
        user_id: i64,
        image: Vec<u8>,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize("RegisterFace", &header, conn).await?;
        tracing::info!(user_id, bytes = image.len(), "register_face requested");
        let outcome = self.service.register_face(user_id, image).await.map_err(failed)?;
        to_json(&RegistrationReply::from(&outcome))
    }

    async fn verify_face(
        &self,
        user_id: i64,
        image: Vec<u8>,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize("VerifyFace", &header, conn).await?;
        tracing::info!(user_id, bytes = image.len(), "verify_face requested");
        let report = self.service.verify_face(user_id, image).await.map_err(failed)?;
        let reply = VerifyFaceReply::from(&report);
        tracing::info!(
            user_id,
            verified = reply.verified,
            remaining_attempts = reply.remaining_attempts,
            account_locked = reply.account_locked,
            "verify_face complete"
        );
        to_json(&reply)
    }

    /// Issue a new backup code. Returns `{"code": "XXXX-XXXX"}`.
    async fn generate_backup_code(
        &self,
        user_id: i64,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize("GenerateBackupCode", &header, conn).await?;
        let code = self.service.generate_backup_code(user_id).await.map_err(failed)?;
        to_json(&serde_json::json!({ "code": code }))
    }

    /// Show the current backup code once. `{"code": null}` afterwards.
    async fn reveal_backup_code(
        &self,
        user_id: i64,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize("RevealBackupCode", &header, conn).await?;
        let code = self.service.reveal_backup_code(user_id).await.map_err(failed)?;
        to_json(&serde_json::json!({ "code": code }))
    }

    async fn verify_backup_code(
        &self,
        user_id: i64,
        code: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize("VerifyBackupCode", &header, conn).await?;
        tracing::info!(user_id, "verify_backup_code requested");
        let (outcome, status) = self
            .service
            .verify_backup_code(user_id, code)
            .await
            .map_err(failed)?;
        to_json(&BackupCodeReply::new(outcome, status))
    }

    async fn unlock_account(
        &self,
        user_id: i64,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize("UnlockAccount", &header, conn).await?;
        self.service.unlock_account(user_id).await.map_err(failed)?;
        to_json(&serde_json::json!({ "ok": true }))
    }

    async fn disable_account(
        &self,
        user_id: i64,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize("DisableAccount", &header, conn).await?;
        self.service.disable_account(user_id).await.map_err(failed)?;
        to_json(&serde_json::json!({ "ok": true }))
    }

    async fn enable_account(
        &self,
        user_id: i64,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize("EnableAccount", &header, conn).await?;
        self.service.enable_account(user_id).await.map_err(failed)?;
        to_json(&serde_json::json!({ "ok": true }))
    }

    /// Return daemon status information as JSON. Open to every caller.
    async fn status(
        &self,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize("Status", &header, conn).await?;
        let status = self.service.status().await.map_err(failed)?;
        to_json(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_status_is_open_to_non_root() {
        assert!(caller_permitted("Status", 1000));
        assert!(caller_permitted("VerifyFace", 0));
        for method in ["CreateUser", "Login", "VerifyFace", "VerifyBackupCode", "UnlockAccount"] {
            assert!(!caller_permitted(method, 1000), "{method}");
        }
    }
}
