// src/services/batch.rs
//
// Size-bounded atomic write primitive. Every aggregation pass stages its
// writes here and commits once; large fan-outs split into ≤500-operation
// transactions committed sequentially, yielding to the scheduler between
// chunks instead of recursing.

use crate::errors::AppResult;
use crate::models::{AddendumEvent, AttendanceRecord, Geopoint, LeaveRecord, ReimbursementEntry};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

/// Upper bound on operations per atomic commit.
pub const MAX_BATCH_OPS: usize = 500;

/// One staged document write.
#[derive(Debug)]
pub enum WriteOp {
    InsertAddendum(Box<AddendumEvent>),
    UpsertAttendance(Box<AttendanceRecord>),
    InsertReimbursement(Box<ReimbursementEntry>),
    FinalizeReimbursement {
        id: Uuid,
        amount: Decimal,
        distance_km: Decimal,
        current: Geopoint,
        current_identifier: Option<String>,
    },
    UpsertLeave(Box<LeaveRecord>),
    TouchRoleCheckIn {
        office_id: Uuid,
        user_phone: String,
        at: DateTime<Utc>,
    },
}

impl WriteOp {
    async fn execute(self, tx: &mut Transaction<'_, Postgres>) -> AppResult<()> {
        match self {
            WriteOp::InsertAddendum(ev) => {
                sqlx::query(
                    r#"INSERT INTO addendum_events (
                        id, office_id, activity_id, user_phone, account_id, action,
                        event_timestamp, server_timestamp, lat, lng, accuracy_meters,
                        activity, is_support_request, is_admin_request, is_auto_generated,
                        day, month, year, distance_accurate, venue_identifier,
                        venue_lat, venue_lng
                    ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22)
                    ON CONFLICT (id) DO NOTHING"#,
                )
                .bind(ev.id)
                .bind(ev.office_id)
                .bind(ev.activity_id)
                .bind(&ev.user_phone)
                .bind(ev.account_id)
                .bind(ev.action)
                .bind(ev.event_timestamp)
                .bind(ev.server_timestamp)
                .bind(ev.geopoint.map(|g| g.lat))
                .bind(ev.geopoint.map(|g| g.lng))
                .bind(ev.accuracy_meters)
                .bind(Json(&ev.activity))
                .bind(ev.is_support_request)
                .bind(ev.is_admin_request)
                .bind(ev.is_auto_generated)
                .bind(ev.day as i32)
                .bind(ev.month as i32)
                .bind(ev.year)
                .bind(ev.distance_accurate)
                .bind(&ev.venue_identifier)
                .bind(ev.venue_geopoint.map(|g| g.lat))
                .bind(ev.venue_geopoint.map(|g| g.lng))
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::UpsertAttendance(rec) => {
                sqlx::query(
                    r#"INSERT INTO attendance_records (
                        office_id, employee_phone, month, year, role, days, created_at, updated_at
                    ) VALUES ($1,$2,$3,$4,$5,$6,NOW(),NOW())
                    ON CONFLICT (office_id, employee_phone, month, year) DO UPDATE
                    SET role = EXCLUDED.role,
                        days = EXCLUDED.days,
                        updated_at = NOW()"#,
                )
                .bind(rec.office_id)
                .bind(&rec.employee_phone)
                .bind(rec.month)
                .bind(rec.year)
                .bind(&rec.role)
                .bind(&rec.days)
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::InsertReimbursement(entry) => {
                // ON CONFLICT DO NOTHING rides the partial unique indexes:
                // one open leg per employee-day, one allowance name per day.
                sqlx::query(
                    r#"INSERT INTO reimbursement_entries (
                        id, office_id, entry_type, name, day, month, year,
                        employee_phone, activity_id, amount, intermediate,
                        previous_lat, previous_lng, current_lat, current_lng,
                        previous_identifier, current_identifier, distance_km,
                        created_at, updated_at
                    ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,NOW(),NOW())
                    ON CONFLICT DO NOTHING"#,
                )
                .bind(entry.id)
                .bind(entry.office_id)
                .bind(entry.entry_type)
                .bind(&entry.name)
                .bind(entry.day)
                .bind(entry.month)
                .bind(entry.year)
                .bind(&entry.employee_phone)
                .bind(entry.activity_id)
                .bind(entry.amount)
                .bind(entry.intermediate)
                .bind(entry.previous_lat)
                .bind(entry.previous_lng)
                .bind(entry.current_lat)
                .bind(entry.current_lng)
                .bind(&entry.previous_identifier)
                .bind(&entry.current_identifier)
                .bind(entry.distance_km)
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::FinalizeReimbursement {
                id,
                amount,
                distance_km,
                current,
                current_identifier,
            } => {
                sqlx::query(
                    r#"UPDATE reimbursement_entries
                       SET intermediate = FALSE,
                           amount = $2,
                           distance_km = $3,
                           current_lat = $4,
                           current_lng = $5,
                           current_identifier = COALESCE($6, current_identifier),
                           updated_at = NOW()
                       WHERE id = $1"#,
                )
                .bind(id)
                .bind(amount)
                .bind(distance_km)
                .bind(current.lat)
                .bind(current.lng)
                .bind(current_identifier)
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::UpsertLeave(leave) => {
                sqlx::query(
                    r#"INSERT INTO leaves (
                        office_id, employee_phone, activity_id, leave_type, reason,
                        start_date, end_date, is_ar, cancelled
                    ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
                    ON CONFLICT (activity_id) DO UPDATE
                    SET leave_type = EXCLUDED.leave_type,
                        reason = EXCLUDED.reason,
                        start_date = EXCLUDED.start_date,
                        end_date = EXCLUDED.end_date,
                        cancelled = EXCLUDED.cancelled"#,
                )
                .bind(leave.office_id)
                .bind(&leave.employee_phone)
                .bind(leave.activity_id)
                .bind(&leave.leave_type)
                .bind(&leave.reason)
                .bind(leave.start_date)
                .bind(leave.end_date)
                .bind(leave.is_ar)
                .bind(leave.cancelled)
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::TouchRoleCheckIn {
                office_id,
                user_phone,
                at,
            } => {
                sqlx::query(
                    r#"UPDATE roles
                       SET last_check_in_at = GREATEST(COALESCE(last_check_in_at, 'epoch'::timestamptz), $3)
                       WHERE office_id = $1 AND user_phone = $2"#,
                )
                .bind(office_id)
                .bind(&user_phone)
                .bind(at)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }
}

/// Staged multi-document write, committed in bounded atomic chunks.
#[derive(Debug, Default)]
pub struct BatchWriter {
    ops: Vec<WriteOp>,
}

impl BatchWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Commit all staged operations in order. Each chunk of up to
    /// `MAX_BATCH_OPS` is one transaction; chunks run strictly one after
    /// another with a scheduler yield in between.
    pub async fn commit(self, pool: &PgPool) -> AppResult<usize> {
        let total = self.ops.len();
        let mut ops = self.ops.into_iter();

        loop {
            let chunk: Vec<WriteOp> = ops.by_ref().take(MAX_BATCH_OPS).collect();
            if chunk.is_empty() {
                break;
            }

            let mut tx = pool.begin().await?;
            for op in chunk {
                op.execute(&mut tx).await?;
            }
            tx.commit().await?;

            tokio::task::yield_now().await;
        }

        debug!(ops = total, "batch committed");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_starts_empty_and_counts_ops() {
        let mut batch = BatchWriter::new();
        assert!(batch.is_empty());
        batch.push(WriteOp::TouchRoleCheckIn {
            office_id: Uuid::new_v4(),
            user_phone: "+911234567890".to_string(),
            at: Utc::now(),
        });
        assert_eq!(batch.len(), 1);
    }
}
