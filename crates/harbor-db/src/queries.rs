use crate::models::{MessageRow, PendingRegistrationRow, RefreshTokenRow, UserRow};
use crate::{Database, is_email_like, normalize_email, normalize_username};
use anyhow::Result;
use harbor_types::models::ChatMessage;
use rusqlite::{Connection, OptionalExtension, params};

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        email: &str,
        pass_hash: &str,
        now_ms: i64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, email, pass_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, normalize_username(username), normalize_email(email), pass_hash, now_ms],
            )?;
            Ok(())
        })
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        let email = normalize_email(email);
        self.with_conn(|conn| query_user(conn, "email", &email))
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        let username = normalize_username(username);
        self.with_conn(|conn| query_user(conn, "username", &username))
    }

    pub fn find_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    /// Resolve a login identifier: email-shaped input is looked up as an
    /// email; anything else as a username, falling back to email.
    pub fn find_user_by_identifier(&self, identifier: &str) -> Result<Option<UserRow>> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Ok(None);
        }

        if is_email_like(identifier) {
            return self.find_user_by_email(identifier);
        }

        if let Some(user) = self.find_user_by_username(identifier)? {
            return Ok(Some(user));
        }
        self.find_user_by_email(identifier)
    }

    // -- Refresh tokens --

    pub fn store_refresh_token(
        &self,
        token: &str,
        user_id: &str,
        expires_at: i64,
        now_ms: i64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO refresh_tokens (token, user_id, created_at, expires_at, revoked_at)
                 VALUES (?1, ?2, ?3, ?4, NULL)",
                params![token, user_id, now_ms, expires_at],
            )?;
            Ok(())
        })
    }

    pub fn get_refresh_token(&self, token: &str) -> Result<Option<RefreshTokenRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT token, user_id, created_at, expires_at, revoked_at
                     FROM refresh_tokens WHERE token = ?1",
                    [token],
                    map_refresh_token,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Idempotent: a token that is unknown or already revoked is left alone.
    pub fn revoke_refresh_token(&self, token: &str, now_ms: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE refresh_tokens SET revoked_at = ?1
                 WHERE token = ?2 AND revoked_at IS NULL",
                params![now_ms, token],
            )?;
            Ok(())
        })
    }

    /// "Sign out everywhere": revokes every live token for the user.
    pub fn revoke_all_for_user(&self, user_id: &str, now_ms: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE refresh_tokens SET revoked_at = ?1
                 WHERE user_id = ?2 AND revoked_at IS NULL",
                params![now_ms, user_id],
            )?;
            Ok(n)
        })
    }

    /// Drops expired and revoked rows; returns how many were deleted.
    pub fn sweep_refresh_tokens(&self, now_ms: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM refresh_tokens
                 WHERE expires_at < ?1 OR revoked_at IS NOT NULL",
                params![now_ms],
            )?;
            Ok(n)
        })
    }

    // -- Pending registrations (OTP) --

    /// At most one pending attempt per email; a new request replaces it.
    pub fn upsert_pending_registration(
        &self,
        email: &str,
        code_hash: &str,
        expires_at: i64,
        username: &str,
        pass_hash: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pending_registrations (email, code_hash, expires_at, username, pass_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(email) DO UPDATE SET
                     code_hash = excluded.code_hash,
                     expires_at = excluded.expires_at,
                     username = excluded.username,
                     pass_hash = excluded.pass_hash",
                params![
                    normalize_email(email),
                    code_hash,
                    expires_at,
                    normalize_username(username),
                    pass_hash
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_pending_registration(&self, email: &str) -> Result<Option<PendingRegistrationRow>> {
        let email = normalize_email(email);
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT email, code_hash, expires_at, username, pass_hash
                     FROM pending_registrations WHERE email = ?1",
                    [&email],
                    |row| {
                        Ok(PendingRegistrationRow {
                            email: row.get(0)?,
                            code_hash: row.get(1)?,
                            expires_at: row.get(2)?,
                            username: row.get(3)?,
                            pass_hash: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn delete_pending_registration(&self, email: &str) -> Result<()> {
        let email = normalize_email(email);
        self.with_conn(|conn| {
            conn.execute("DELETE FROM pending_registrations WHERE email = ?1", [&email])?;
            Ok(())
        })
    }

    pub fn sweep_pending_registrations(&self, now_ms: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM pending_registrations WHERE expires_at < ?1",
                params![now_ms],
            )?;
            Ok(n)
        })
    }

    // -- Messages --

    pub fn append_message(&self, msg: &ChatMessage) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, room, client_id, username, text, system, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    msg.id.to_string(),
                    msg.room,
                    msg.client_id,
                    msg.username,
                    msg.text,
                    msg.system as i64,
                    msg.created_at
                ],
            )?;
            Ok(())
        })
    }

    /// The most recent `limit` messages for a room, returned oldest first
    /// for direct client rendering. Ties on created_at keep insertion order.
    pub fn recent_messages(&self, room: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, room, client_id, username, text, system, created_at
                 FROM messages
                 WHERE room = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2",
            )?;

            let mut rows = stmt
                .query_map(params![room, limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.reverse();
            Ok(rows)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    // `column` is one of our own identifiers, never user input
    let sql = format!(
        "SELECT id, username, email, pass_hash, created_at FROM users WHERE {} = ?1",
        column
    );
    let row = conn
        .query_row(&sql, [value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                email: row.get(2)?,
                pass_hash: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .optional()?;
    Ok(row)
}

fn map_refresh_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<RefreshTokenRow> {
    Ok(RefreshTokenRow {
        token: row.get(0)?,
        user_id: row.get(1)?,
        created_at: row.get(2)?,
        expires_at: row.get(3)?,
        revoked_at: row.get(4)?,
    })
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room: row.get(1)?,
        client_id: row.get(2)?,
        username: row.get(3)?,
        text: row.get(4)?,
        system: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::is_unique_violation;
    use uuid::Uuid;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn add_user(db: &Database, username: &str, email: &str) -> String {
        let id = Uuid::new_v4().to_string();
        db.create_user(&id, username, email, "hash", 1_000).unwrap();
        id
    }

    #[test]
    fn user_lookup_and_identifier_resolution() {
        let db = db();
        add_user(&db, "alice", "Alice@X.com");

        // email stored normalized
        assert!(db.find_user_by_email("ALICE@x.COM").unwrap().is_some());
        assert!(db.find_user_by_username("alice").unwrap().is_some());

        // email-shaped identifier resolves by email
        assert!(db.find_user_by_identifier("alice@x.com").unwrap().is_some());
        // plain identifier resolves by username
        assert!(db.find_user_by_identifier("alice").unwrap().is_some());
        // unknown identifier
        assert!(db.find_user_by_identifier("bob").unwrap().is_none());
        assert!(db.find_user_by_identifier("   ").unwrap().is_none());
    }

    #[test]
    fn duplicate_user_is_unique_violation() {
        let db = db();
        add_user(&db, "alice", "alice@x.com");

        let err = db
            .create_user("other-id", "alice", "other@x.com", "hash", 2_000)
            .unwrap_err();
        assert!(is_unique_violation(&err));

        let err = db
            .create_user("other-id", "bob", "alice@x.com", "hash", 2_000)
            .unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[test]
    fn refresh_token_lifecycle() {
        let db = db();
        let uid = add_user(&db, "alice", "alice@x.com");

        db.store_refresh_token("t1", &uid, 10_000, 1_000).unwrap();
        let row = db.get_refresh_token("t1").unwrap().unwrap();
        assert!(row.is_usable(5_000));
        assert!(!row.is_usable(10_001));

        db.revoke_refresh_token("t1", 2_000).unwrap();
        let row = db.get_refresh_token("t1").unwrap().unwrap();
        assert_eq!(row.revoked_at, Some(2_000));

        // second revocation is a no-op, not an error, and keeps the
        // original revocation timestamp
        db.revoke_refresh_token("t1", 9_000).unwrap();
        let row = db.get_refresh_token("t1").unwrap().unwrap();
        assert_eq!(row.revoked_at, Some(2_000));

        // revoking an unknown token is a no-op too
        db.revoke_refresh_token("nope", 2_000).unwrap();
    }

    #[test]
    fn revoke_all_spares_other_users() {
        let db = db();
        let alice = add_user(&db, "alice", "alice@x.com");
        let bob = add_user(&db, "bob", "bob@x.com");

        db.store_refresh_token("a1", &alice, 10_000, 1_000).unwrap();
        db.store_refresh_token("a2", &alice, 10_000, 1_000).unwrap();
        db.store_refresh_token("b1", &bob, 10_000, 1_000).unwrap();

        let n = db.revoke_all_for_user(&alice, 2_000).unwrap();
        assert_eq!(n, 2);
        assert!(db.get_refresh_token("a1").unwrap().unwrap().is_revoked());
        assert!(db.get_refresh_token("a2").unwrap().unwrap().is_revoked());
        assert!(!db.get_refresh_token("b1").unwrap().unwrap().is_revoked());
    }

    #[test]
    fn sweep_deletes_expired_and_revoked_only() {
        let db = db();
        let uid = add_user(&db, "alice", "alice@x.com");

        db.store_refresh_token("live", &uid, 10_000, 1_000).unwrap();
        db.store_refresh_token("expired", &uid, 3_000, 1_000).unwrap();
        db.store_refresh_token("revoked", &uid, 10_000, 1_000).unwrap();
        db.revoke_refresh_token("revoked", 2_000).unwrap();

        let n = db.sweep_refresh_tokens(5_000).unwrap();
        assert_eq!(n, 2);
        assert!(db.get_refresh_token("live").unwrap().is_some());
        assert!(db.get_refresh_token("expired").unwrap().is_none());
        assert!(db.get_refresh_token("revoked").unwrap().is_none());
    }

    #[test]
    fn pending_registration_upsert_replaces() {
        let db = db();
        db.upsert_pending_registration("a@x.com", "h1", 5_000, "alice", "p1")
            .unwrap();
        db.upsert_pending_registration("A@X.com", "h2", 9_000, "alice2", "p2")
            .unwrap();

        let row = db.get_pending_registration("a@x.com").unwrap().unwrap();
        assert_eq!(row.code_hash, "h2");
        assert_eq!(row.username, "alice2");
        assert_eq!(row.expires_at, 9_000);

        db.delete_pending_registration("a@x.com").unwrap();
        assert!(db.get_pending_registration("a@x.com").unwrap().is_none());
    }

    #[test]
    fn pending_sweep() {
        let db = db();
        db.upsert_pending_registration("old@x.com", "h", 1_000, "old", "p")
            .unwrap();
        db.upsert_pending_registration("new@x.com", "h", 9_000, "new", "p")
            .unwrap();

        let n = db.sweep_pending_registrations(5_000).unwrap();
        assert_eq!(n, 1);
        assert!(db.get_pending_registration("old@x.com").unwrap().is_none());
        assert!(db.get_pending_registration("new@x.com").unwrap().is_some());
    }

    #[test]
    fn recent_messages_oldest_first_with_limit() {
        let db = db();
        for i in 0..5 {
            let msg = harbor_types::models::ChatMessage::user(
                "general",
                "alice",
                format!("m{}", i),
                None,
                1_000 + i,
            );
            db.append_message(&msg).unwrap();
        }

        let rows = db.recent_messages("general", 3).unwrap();
        let texts: Vec<_> = rows.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);

        assert!(db.recent_messages("empty", 3).unwrap().is_empty());
    }

    #[test]
    fn recent_messages_ties_keep_insertion_order() {
        let db = db();
        // identical timestamps: insertion order must win
        for name in ["first", "second", "third"] {
            let msg = harbor_types::models::ChatMessage::user(
                "general",
                "alice",
                name.to_string(),
                None,
                1_000,
            );
            db.append_message(&msg).unwrap();
        }

        let rows = db.recent_messages("general", 10).unwrap();
        let texts: Vec<_> = rows.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn system_message_roundtrip() {
        let db = db();
        let msg = harbor_types::models::ChatMessage::system("general", "alice joined".into(), 1_000);
        db.append_message(&msg).unwrap();

        let rows = db.recent_messages("general", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].system);
        assert!(rows[0].username.is_none());
        let wire = rows.into_iter().next().unwrap().into_message();
        assert_eq!(wire.id, msg.id);
    }
}
