//! 購入完了・抽選結果の通知
//!
//! 送信失敗は呼び出し側でログに残すだけで、コミットや抽選は巻き戻さない。

use async_trait::async_trait;
use tracing::info;

use crate::model::{Order, Win};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn order_committed(&self, order: &Order, bonus: &[u32]) -> anyhow::Result<()>;

    async fn draw_completed(&self, win: &Win) -> anyhow::Result<()>;
}

/// ログに出すだけの実装（メール送信は外部）
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn order_committed(&self, order: &Order, bonus: &[u32]) -> anyhow::Result<()> {
        info!(
            order_id = %order.order_id,
            user_id = %order.user_id,
            tickets = ?order.ticket_numbers,
            bonus = ?bonus,
            "purchase confirmation queued"
        );
        Ok(())
    }

    async fn draw_completed(&self, win: &Win) -> anyhow::Result<()> {
        info!(
            competition_id = %win.competition_id,
            user_id = %win.user_id,
            ticket_number = win.ticket_number,
            "winner notification queued"
        );
        Ok(())
    }
}
