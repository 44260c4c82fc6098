//! Queue admission: concurrency caps and weekly time windows.
//!
//! A sweep runs every 60 seconds and whenever the engine kicks it (add,
//! pause, completion). Each enabled queue whose window currently admits gets
//! its next `max_concurrent - active` members started, in queue order.

use crate::engine::Engine;
use crate::store::records::{DownloadStatus, Schedule};
use anyhow::Result;
use chrono::{Datelike, Local, Timelike};
use std::collections::HashMap;
use std::time::Duration;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawns the periodic admission task. Runs until the returned handle is
/// aborted or the runtime shuts down.
pub fn spawn(engine: Engine) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = engine.inner.sched_kick.notified() => {}
            }
            if let Err(e) = sweep(&engine).await {
                tracing::warn!("scheduler sweep: {e:#}");
            }
        }
    })
}

/// One admission pass over every queue.
pub(crate) async fn sweep(engine: &Engine) -> Result<()> {
    let _guard = engine.inner.sweep_lock.lock().await;
    let queues = engine.queues();
    let statuses: HashMap<String, DownloadStatus> = engine
        .list()
        .into_iter()
        .map(|d| (d.id, d.status))
        .collect();

    let now = Local::now();
    for queue in queues.iter().filter(|q| q.enabled) {
        if let Some(schedule) = &queue.schedule {
            let weekday = now.weekday().num_days_from_sunday() as u8;
            let minute = (now.hour() * 60 + now.minute()) as u16;
            if !admits_at(schedule, weekday, minute) {
                continue;
            }
        }

        let active = queue
            .download_ids
            .iter()
            .filter(|id| statuses.get(*id).is_some_and(|s| s.is_active()))
            .count();
        let mut slots = queue.max_concurrent.saturating_sub(active);
        if slots == 0 {
            continue;
        }

        for id in &queue.download_ids {
            if slots == 0 {
                break;
            }
            if statuses.get(id) != Some(&DownloadStatus::Queued) {
                continue;
            }
            match engine.start(id).await {
                Ok(()) => {
                    tracing::debug!(queue = %queue.id, id = %id, "admitted download");
                    slots -= 1;
                }
                Err(e) => tracing::warn!(queue = %queue.id, id = %id, "admission failed: {e:#}"),
            }
        }
    }
    Ok(())
}

/// Window check for a given local weekday (0 = Sunday) and minute-of-day.
///
/// Inclusive on both bounds; when `end < start` the window wraps past
/// midnight: `[start, 24:00) ∪ [0, end]`.
pub(crate) fn admits_at(schedule: &Schedule, weekday: u8, minute: u16) -> bool {
    if !schedule.days.contains(&weekday) {
        return false;
    }
    if schedule.start_minute <= schedule.end_minute {
        (schedule.start_minute..=schedule.end_minute).contains(&minute)
    } else {
        minute >= schedule.start_minute || minute <= schedule.end_minute
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRI: u8 = 5;
    const SAT: u8 = 6;

    fn hhmm(h: u16, m: u16) -> u16 {
        h * 60 + m
    }

    #[test]
    fn plain_window_inclusive_bounds() {
        let s = Schedule::from_hhmm("09:00", "17:00", vec![1, 2, 3, 4, 5]).unwrap();
        assert!(admits_at(&s, 1, hhmm(9, 0)));
        assert!(admits_at(&s, 5, hhmm(17, 0)));
        assert!(admits_at(&s, 3, hhmm(12, 30)));
        assert!(!admits_at(&s, 3, hhmm(8, 59)));
        assert!(!admits_at(&s, 3, hhmm(17, 1)));
    }

    #[test]
    fn wrap_past_midnight() {
        let s = Schedule::from_hhmm("22:00", "02:00", vec![FRI]).unwrap();
        assert!(admits_at(&s, FRI, hhmm(22, 0)));
        assert!(admits_at(&s, FRI, hhmm(23, 59)));
        assert!(admits_at(&s, FRI, hhmm(0, 30)));
        assert!(admits_at(&s, FRI, hhmm(2, 0)));
        assert!(!admits_at(&s, FRI, hhmm(2, 1)));
        assert!(!admits_at(&s, FRI, hhmm(12, 0)));
    }

    #[test]
    fn wrong_weekday_never_admits() {
        let s = Schedule::from_hhmm("22:00", "02:00", vec![FRI]).unwrap();
        assert!(!admits_at(&s, SAT, hhmm(23, 0)));
        assert!(!admits_at(&s, 0, hhmm(23, 0)));
    }

    #[test]
    fn multiple_days() {
        let s = Schedule::from_hhmm("00:00", "23:59", vec![0, 6]).unwrap();
        assert!(admits_at(&s, 0, 0));
        assert!(admits_at(&s, 6, hhmm(23, 59)));
        assert!(!admits_at(&s, 3, hhmm(12, 0)));
    }
}
