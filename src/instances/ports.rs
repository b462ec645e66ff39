//! Logical port allocation.
//!
//! Each instance gets a unique integer. On the local backend it is also the
//! host port the gateway is published on; the remote backend only uses it for
//! bookkeeping.

use crate::error::{DbError, Result};
use anyhow::Context as _;
use sqlx::SqliteConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocator {
    base: i64,
    limit: i64,
}

pub const DEFAULT_PORT_BASE: u16 = 19000;
pub const DEFAULT_PORT_LIMIT: u16 = 19999;

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_BASE, DEFAULT_PORT_LIMIT)
    }
}

impl PortAllocator {
    pub fn new(base: u16, limit: u16) -> Self {
        Self {
            base: i64::from(base),
            limit: i64::from(limit.max(base)),
        }
    }

    /// Lowest value in `[base, limit]` not present in `taken` (sorted ascending).
    pub fn pick(&self, taken: &[i64]) -> Option<i64> {
        let mut candidate = self.base;
        for &port in taken {
            if port < candidate {
                continue;
            }
            if port > candidate {
                break;
            }
            candidate += 1;
        }
        (candidate <= self.limit).then_some(candidate)
    }

    /// Pick the next free port inside the caller's transaction.
    pub async fn allocate(&self, conn: &mut SqliteConnection) -> Result<i64> {
        let taken: Vec<i64> = sqlx::query_scalar(
            "SELECT port FROM instances WHERE port BETWEEN ? AND ? ORDER BY port ASC",
        )
        .bind(self.base)
        .bind(self.limit)
        .fetch_all(conn)
        .await
        .context("failed to read allocated ports")?;

        self.pick(&taken).ok_or_else(|| {
            DbError::PortsExhausted {
                base: self.base,
                limit: self.limit,
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_base_when_nothing_is_taken() {
        assert_eq!(PortAllocator::new(100, 110).pick(&[]), Some(100));
    }

    #[test]
    fn fills_the_lowest_gap() {
        let allocator = PortAllocator::new(100, 110);
        assert_eq!(allocator.pick(&[100, 101, 103]), Some(102));
        assert_eq!(allocator.pick(&[101, 102]), Some(100));
    }

    #[test]
    fn exhausted_range_yields_none() {
        let allocator = PortAllocator::new(100, 101);
        assert_eq!(allocator.pick(&[100, 101]), None);
    }
}
