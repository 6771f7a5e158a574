//! 予約エンジン
//!
//! ## 流れ（reserve）
//! 1. 使用不可集合 = リレーショナル側（SOLD / FREE_ENTRY / 他人の期限内 RESERVED）
//!    ∪ キャッシュ上の他人のチケットロック
//! 2. 残りから部分 Fisher–Yates で一様に抽出
//! 3. キャッシュでロックを all-or-nothing 取得 → 予約エントリを書く
//! 4. リレーショナル側へ条件付き UPDATE で反映。件数が足りなければ巻き戻して競合エラー
//!
//! どの経路も「全部押さえた」か「何も押さえていない」のどちらかで終わる。

use std::collections::HashSet;
use std::sync::Arc;

use ticket_core::{available_numbers, normalize_selection, sample_distinct, Clock};
use tracing::{debug, info, warn};

use crate::cache::{keys, LockStore};
use crate::error::{TicketError, TicketResult};
use crate::model::{Competition, CompetitionStatus, Reservation};
use crate::store::TicketRepository;

pub struct ReservationEngine {
    cache: Arc<dyn LockStore>,
    store: Arc<dyn TicketRepository>,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
}

impl ReservationEngine {
    pub fn new(
        cache: Arc<dyn LockStore>,
        store: Arc<dyn TicketRepository>,
        clock: Arc<dyn Clock>,
        ttl_ms: u64,
    ) -> Self {
        Self {
            cache,
            store,
            clock,
            ttl_ms: ttl_ms.max(1),
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub(crate) async fn competition(&self, competition_id: &str) -> TicketResult<Competition> {
        self.store
            .competition(competition_id)
            .await?
            .ok_or_else(|| TicketError::CompetitionNotFound(competition_id.to_string()))
    }

    async fn active_competition(&self, competition_id: &str) -> TicketResult<Competition> {
        let competition = self.competition(competition_id).await?;
        if competition.status != CompetitionStatus::Active {
            return Err(TicketError::CompetitionNotActive {
                id: competition.id,
                status: competition.status,
            });
        }
        Ok(competition)
    }

    /// 購入済み + 今回分が上限以内か（予約中は数えない）
    async fn check_user_limit(
        &self,
        competition: &Competition,
        user_id: &str,
        requested: u32,
    ) -> TicketResult<()> {
        let max = competition.max_tickets_per_user;
        if requested > max {
            return Err(TicketError::InvalidQuantity { requested, max });
        }
        let held = self
            .store
            .sold_count_for_user(&competition.id, user_id)
            .await?;
        if held.saturating_add(requested) > max {
            return Err(TicketError::UserLimitExceeded {
                held,
                requested,
                max,
            });
        }
        Ok(())
    }

    /// `owner` から見て取得できない番号
    async fn unavailable_for(
        &self,
        competition_id: &str,
        owner: &str,
        now_ms: u64,
    ) -> TicketResult<HashSet<u32>> {
        let mut unavailable = self
            .store
            .unavailable_numbers(competition_id, owner, now_ms)
            .await?;
        // リレーショナル側の反映より先にロックが立つので、キャッシュも見る
        let locks = self
            .cache
            .scan_prefix(&keys::ticket_lock_prefix(competition_id))
            .await?;
        unavailable.extend(
            locks
                .into_iter()
                .filter(|(_, holder)| holder != owner)
                .filter_map(|(key, _)| keys::lock_ticket_number(&key)),
        );
        Ok(unavailable)
    }

    /// 生存中の予約（期限切れは無いものとして扱う）
    pub async fn current(
        &self,
        competition_id: &str,
        user_id: &str,
    ) -> TicketResult<Option<Reservation>> {
        let key = keys::reservation(competition_id, user_id);
        let Some(raw) = self.cache.get(&key).await? else {
            return Ok(None);
        };
        let reservation: Reservation = serde_json::from_str(&raw)?;
        let now = self.clock.now_millis();
        Ok(reservation.is_live(now).then_some(reservation))
    }

    pub async fn reserve(
        &self,
        competition_id: &str,
        user_id: &str,
        quantity: u32,
    ) -> TicketResult<Reservation> {
        let competition = self.active_competition(competition_id).await?;
        if quantity == 0 {
            return Err(TicketError::InvalidQuantity {
                requested: quantity,
                max: competition.max_tickets_per_user,
            });
        }

        let now = self.clock.now_millis();
        let unavailable = self.unavailable_for(competition_id, user_id, now).await?;
        let pool = available_numbers(competition.total_tickets, &unavailable);
        // 在庫不足は上限チェックより先に返す（「残り N 枚」を見せるため）
        if pool.len() < quantity as usize {
            return Err(TicketError::InsufficientInventory {
                requested: quantity,
                available: pool.len() as u32,
            });
        }
        self.check_user_limit(&competition, user_id, quantity).await?;

        let previous = self.current(competition_id, user_id).await?;
        let available = pool.len();
        let numbers = sample_distinct(pool, quantity as usize, &mut rand::thread_rng()).ok_or(
            TicketError::InsufficientInventory {
                requested: quantity,
                available: available as u32,
            },
        )?;

        self.claim(competition_id, user_id, numbers, previous).await
    }

    /// 期限切れ後にクライアントが持っている番号で予約を作り直す
    pub async fn recreate(
        &self,
        competition_id: &str,
        user_id: &str,
        ticket_numbers: &[u32],
    ) -> TicketResult<Reservation> {
        let competition = self.active_competition(competition_id).await?;
        let numbers = normalize_selection(competition.total_tickets, ticket_numbers)?;
        self.check_user_limit(&competition, user_id, numbers.len() as u32)
            .await?;

        let now = self.clock.now_millis();
        let previous = self.current(competition_id, user_id).await?;
        let unavailable = self.unavailable_for(competition_id, user_id, now).await?;
        if let Some(&taken) = numbers.iter().find(|n| unavailable.contains(*n)) {
            debug!(
                competition_id = %competition_id,
                user_id = %user_id,
                ticket_number = taken,
                "recreate rejected: number no longer available"
            );
            return Err(TicketError::ReservationConflict);
        }

        self.claim(competition_id, user_id, numbers, previous).await
    }

    /// ロック取得 → 予約エントリ → リレーショナル反映。
    /// 失敗時は今回新たに押さえた分だけ戻し、以前の予約はそのまま残す。
    async fn claim(
        &self,
        competition_id: &str,
        user_id: &str,
        numbers: Vec<u32>,
        previous: Option<Reservation>,
    ) -> TicketResult<Reservation> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(self.ttl_ms);
        let lock_keys = keys::ticket_locks(competition_id, &numbers);

        if !self
            .cache
            .acquire_all(&lock_keys, user_id, self.ttl_ms)
            .await?
        {
            debug!(
                competition_id = %competition_id,
                user_id = %user_id,
                "ticket lock contested"
            );
            return Err(TicketError::ReservationConflict);
        }

        let previous_numbers: HashSet<u32> = previous
            .as_ref()
            .map(|r| r.ticket_numbers.iter().copied().collect())
            .unwrap_or_default();
        let fresh: Vec<u32> = numbers
            .iter()
            .copied()
            .filter(|n| !previous_numbers.contains(n))
            .collect();

        let reservation = Reservation {
            competition_id: competition_id.to_string(),
            user_id: user_id.to_string(),
            ticket_numbers: numbers,
            reserved_at: now,
            expires_at,
        };

        let mirrored = match self.write_and_mirror(&reservation, now).await {
            Ok(n) => n,
            Err(err) => {
                self.rollback_claim(&reservation, &fresh, previous.as_ref())
                    .await;
                return Err(err);
            }
        };
        if mirrored < reservation.ticket_numbers.len() {
            warn!(
                competition_id = %competition_id,
                user_id = %user_id,
                expected = reservation.ticket_numbers.len(),
                mirrored,
                "relational mirror disagrees with cache locks, rolling back"
            );
            self.rollback_claim(&reservation, &fresh, previous.as_ref())
                .await;
            return Err(TicketError::ReservationConflict);
        }

        // 以前の予約で今回選ばれなかった番号を手放す
        if let Some(previous) = previous {
            let kept: HashSet<u32> = reservation.ticket_numbers.iter().copied().collect();
            let leftovers: Vec<u32> = previous
                .ticket_numbers
                .into_iter()
                .filter(|n| !kept.contains(n))
                .collect();
            if !leftovers.is_empty() {
                self.release_leftovers(competition_id, user_id, &leftovers)
                    .await;
            }
        }

        info!(
            competition_id = %competition_id,
            user_id = %user_id,
            count = reservation.ticket_numbers.len(),
            expires_at = reservation.expires_at,
            "tickets reserved"
        );
        Ok(reservation)
    }

    async fn write_and_mirror(&self, reservation: &Reservation, now_ms: u64) -> TicketResult<usize> {
        let key = keys::reservation(&reservation.competition_id, &reservation.user_id);
        self.cache
            .set(&key, &serde_json::to_string(reservation)?, self.ttl_ms)
            .await?;
        self.store
            .reserve_tickets(
                &reservation.competition_id,
                &reservation.user_id,
                &reservation.ticket_numbers,
                reservation.expires_at,
                now_ms,
            )
            .await
    }

    /// 新しい予約は確定済みなので、ここでの失敗はログに残して TTL 切れに任せる
    async fn release_leftovers(&self, competition_id: &str, user_id: &str, leftovers: &[u32]) {
        if let Err(err) = self
            .cache
            .release_owned(&keys::ticket_locks(competition_id, leftovers), user_id)
            .await
        {
            warn!(competition_id = %competition_id, user_id = %user_id, error = %err, "superseded lock release failed");
        }
        if let Err(err) = self
            .store
            .release_tickets(competition_id, user_id, leftovers)
            .await
        {
            warn!(competition_id = %competition_id, user_id = %user_id, error = %err, "superseded row release failed");
        }
    }

    async fn rollback_claim(
        &self,
        attempted: &Reservation,
        fresh: &[u32],
        previous: Option<&Reservation>,
    ) {
        let competition_id = attempted.competition_id.as_str();
        let user_id = attempted.user_id.as_str();
        if let Err(err) = self
            .cache
            .release_owned(&keys::ticket_locks(competition_id, fresh), user_id)
            .await
        {
            warn!(competition_id = %competition_id, error = %err, "lock rollback failed");
        }
        if let Err(err) = self
            .store
            .release_tickets(competition_id, user_id, fresh)
            .await
        {
            warn!(competition_id = %competition_id, error = %err, "row rollback failed");
        }

        let key = keys::reservation(competition_id, user_id);
        let now = self.clock.now_millis();
        let restored = match previous.filter(|p| p.is_live(now)) {
            Some(p) => match serde_json::to_string(p) {
                Ok(raw) => self.cache.set(&key, &raw, p.expires_at - now).await,
                Err(err) => Err(err.into()),
            },
            None => self.cache.delete(&key).await.map(|_| ()),
        };
        if let Err(err) = restored {
            warn!(competition_id = %competition_id, error = %err, "reservation entry rollback failed");
        }
    }

    /// チェックアウト開始時に予約・ロック・行の期限をまとめて延ばす
    pub async fn extend(&self, competition_id: &str, user_id: &str) -> TicketResult<Reservation> {
        let Some(mut reservation) = self.current(competition_id, user_id).await? else {
            return Err(TicketError::NoActiveReservation);
        };
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(self.ttl_ms);
        let count = reservation.ticket_numbers.len();
        let lock_keys = keys::ticket_locks(competition_id, &reservation.ticket_numbers);

        let refreshed = self
            .cache
            .refresh_owned(&lock_keys, user_id, self.ttl_ms)
            .await?;
        // 一部のロックだけ消えていた場合は取り直す
        if refreshed < count
            && !self
                .cache
                .acquire_all(&lock_keys, user_id, self.ttl_ms)
                .await?
        {
            self.drop_reservation(&reservation).await;
            return Err(TicketError::ReservationConflict);
        }

        let rows = self
            .store
            .refresh_reservation(
                competition_id,
                user_id,
                &reservation.ticket_numbers,
                expires_at,
            )
            .await?;
        if rows < count {
            warn!(
                competition_id = %competition_id,
                user_id = %user_id,
                expected = count,
                refreshed = rows,
                "reservation rows changed underneath, dropping reservation"
            );
            self.drop_reservation(&reservation).await;
            return Err(TicketError::ReservationConflict);
        }

        reservation.expires_at = expires_at;
        self.cache
            .set(
                &keys::reservation(competition_id, user_id),
                &serde_json::to_string(&reservation)?,
                self.ttl_ms,
            )
            .await?;
        debug!(competition_id = %competition_id, user_id = %user_id, expires_at, "reservation extended");
        Ok(reservation)
    }

    /// 予約をキャッシュ・リレーショナル両方から完全に外す
    async fn drop_reservation(&self, reservation: &Reservation) {
        let competition_id = reservation.competition_id.as_str();
        let user_id = reservation.user_id.as_str();
        if let Err(err) = self
            .cache
            .release_owned(
                &keys::ticket_locks(competition_id, &reservation.ticket_numbers),
                user_id,
            )
            .await
        {
            warn!(competition_id = %competition_id, error = %err, "lock release failed");
        }
        if let Err(err) = self
            .store
            .release_tickets(competition_id, user_id, &reservation.ticket_numbers)
            .await
        {
            warn!(competition_id = %competition_id, error = %err, "row release failed");
        }
        if let Err(err) = self
            .cache
            .delete(&keys::reservation(competition_id, user_id))
            .await
        {
            warn!(competition_id = %competition_id, error = %err, "reservation delete failed");
        }
    }

    /// キャッシュ側の予約とロックを消す。行は戻さない。
    /// 予約が無ければ false（no-op）。
    pub async fn release(&self, competition_id: &str, user_id: &str) -> TicketResult<bool> {
        let key = keys::reservation(competition_id, user_id);
        let Some(raw) = self.cache.get(&key).await? else {
            return Ok(false);
        };
        match serde_json::from_str::<Reservation>(&raw) {
            Ok(reservation) => {
                self.cache
                    .release_owned(
                        &keys::ticket_locks(competition_id, &reservation.ticket_numbers),
                        user_id,
                    )
                    .await?;
            }
            Err(err) => {
                warn!(competition_id = %competition_id, user_id = %user_id, error = %err, "unreadable reservation entry");
            }
        }
        self.cache.delete(&key).await?;
        Ok(true)
    }

    /// 利用者による取り消し。キャッシュ側を外したうえで本人の RESERVED 行も AVAILABLE に戻す。
    /// 予約が無ければ None。
    pub async fn cancel(
        &self,
        competition_id: &str,
        user_id: &str,
    ) -> TicketResult<Option<Reservation>> {
        let key = keys::reservation(competition_id, user_id);
        let Some(raw) = self.cache.get(&key).await? else {
            return Ok(None);
        };
        let reservation = match serde_json::from_str::<Reservation>(&raw) {
            Ok(reservation) => reservation,
            Err(err) => {
                warn!(competition_id = %competition_id, user_id = %user_id, error = %err, "unreadable reservation entry");
                self.cache.delete(&key).await?;
                return Ok(None);
            }
        };
        self.release(competition_id, user_id).await?;
        let reverted = self
            .store
            .release_tickets(competition_id, user_id, &reservation.ticket_numbers)
            .await?;
        debug!(
            competition_id = %competition_id,
            user_id = %user_id,
            reverted,
            "reservation cancelled"
        );
        Ok(Some(reservation))
    }

    /// 注文の番号についてキャッシュ側を片付ける。
    /// 予約エントリがこの番号を含んでいればエントリごと消す。
    pub async fn release_numbers(
        &self,
        competition_id: &str,
        user_id: &str,
        numbers: &[u32],
    ) -> TicketResult<()> {
        self.cache
            .release_owned(&keys::ticket_locks(competition_id, numbers), user_id)
            .await?;
        if let Some(reservation) = self.current(competition_id, user_id).await? {
            if reservation
                .ticket_numbers
                .iter()
                .any(|n| numbers.contains(n))
            {
                self.release(competition_id, user_id).await?;
            }
        }
        Ok(())
    }

    /// 郵送による無料応募: ランダムに 1 枚選んで FREE_ENTRY にする
    pub async fn claim_free_entry(&self, competition_id: &str, user_id: &str) -> TicketResult<u32> {
        let competition = self.active_competition(competition_id).await?;
        let owner = format!("free-entry:{}", user_id);
        let now = self.clock.now_millis();
        let unavailable = self.unavailable_for(competition_id, &owner, now).await?;
        let pool = available_numbers(competition.total_tickets, &unavailable);
        let available = pool.len() as u32;
        let ticket_number = sample_distinct(pool, 1, &mut rand::thread_rng())
            .and_then(|picked| picked.first().copied())
            .ok_or(TicketError::InsufficientInventory {
                requested: 1,
                available,
            })?;

        let lock = keys::ticket_locks(competition_id, &[ticket_number]);
        if !self.cache.acquire_all(&lock, &owner, self.ttl_ms).await? {
            return Err(TicketError::ReservationConflict);
        }
        let granted = self
            .store
            .grant_free_entry(competition_id, user_id, ticket_number, now)
            .await;
        // FREE_ENTRY 行が正本になるのでロックはすぐ外す
        if let Err(err) = self.cache.release_owned(&lock, &owner).await {
            warn!(competition_id = %competition_id, error = %err, "free entry lock release failed");
        }
        match granted? {
            0 => Err(TicketError::ReservationConflict),
            _ => {
                info!(competition_id = %competition_id, user_id = %user_id, ticket_number, "free entry granted");
                Ok(ticket_number)
            }
        }
    }
}
