//! Redis-backed [`TaskQueue`].
//!
//! Each lane is a Redis list, `<prefix>queue:<lane>`. Producers `LPUSH` and
//! consumers `RPOP`, so each lane is FIFO. Popping never blocks: a worker
//! checks the lanes in priority order and sleeps when all are empty.

use redis::{AsyncCommands, aio::ConnectionManager};

use super::{Lane, Task, TaskQueue, decode_task, encode_task};
use crate::prelude::*;

/// A [`TaskQueue`] shared through Redis.
pub struct RedisTaskQueue {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisTaskQueue {
    pub fn new(conn: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.to_owned(),
        }
    }

    fn lane_key(&self, lane: Lane) -> String {
        format!("{}queue:{}", self.key_prefix, lane.name())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn push(&self, lane: Lane, task: &Task) -> Result<()> {
        let raw = encode_task(task)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(self.lane_key(lane), raw)
            .await
            .with_context(|| format!("failed to push task onto lane {lane}"))
    }

    async fn pop(&self) -> Result<Option<(Lane, Task)>> {
        let mut conn = self.conn.clone();
        for lane in Lane::BY_PRIORITY {
            let raw: Option<String> = redis::cmd("RPOP")
                .arg(self.lane_key(lane))
                .query_async(&mut conn)
                .await
                .with_context(|| format!("failed to pop from lane {lane}"))?;
            if let Some(raw) = raw {
                return Ok(Some((lane, decode_task(lane, &raw)?)));
            }
        }
        Ok(None)
    }

    async fn pending_count(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for lane in Lane::BY_PRIORITY {
            pipe.llen(self.lane_key(lane));
        }
        let lengths: Vec<usize> = pipe
            .query_async(&mut conn)
            .await
            .context("failed to count queued tasks")?;
        Ok(lengths.into_iter().sum())
    }
}
