use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            email       TEXT NOT NULL UNIQUE,
            pass_hash   TEXT NOT NULL,
            created_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_users_email ON users(email);
        CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);

        CREATE TABLE IF NOT EXISTS refresh_tokens (
            token       TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at  INTEGER NOT NULL,
            expires_at  INTEGER NOT NULL,
            revoked_at  INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_refresh_user ON refresh_tokens(user_id);
        CREATE INDEX IF NOT EXISTS idx_refresh_expires ON refresh_tokens(expires_at);

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            room        TEXT NOT NULL,
            client_id   TEXT,
            username    TEXT,
            text        TEXT NOT NULL,
            system      INTEGER NOT NULL DEFAULT 0,
            created_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room_time
            ON messages(room, created_at DESC);

        -- Pending registrations persist so an OTP survives a restart
        CREATE TABLE IF NOT EXISTS pending_registrations (
            email       TEXT PRIMARY KEY,
            code_hash   TEXT NOT NULL,
            expires_at  INTEGER NOT NULL,
            username    TEXT NOT NULL,
            pass_hash   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_pending_expires
            ON pending_registrations(expires_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
