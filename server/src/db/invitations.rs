//! Invitation tokens minted for new users.

use chrono::Utc;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

/// Mint a token for `user_id`, or return the one already minted.
pub async fn ensure_invitation(
    conn: &mut PgConnection,
    user_id: &str,
    invited_by: Option<&str>,
) -> Result<String, sqlx::Error> {
    let token = Uuid::new_v4().simple().to_string();
    sqlx::query(
        r#"
        INSERT INTO invitations (token, user_id, invited_by, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(&token)
    .bind(user_id)
    .bind(invited_by)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query("SELECT token FROM invitations WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await?;
    row.try_get("token")
}
