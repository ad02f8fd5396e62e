use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Duration,
};

#[derive(Debug, Default)]
struct PauseState {
    holds: usize,
    held_by_user: bool,
    ticking: bool,
}

impl PauseState {
    fn paused(&self) -> bool {
        self.holds > 0 || self.held_by_user
    }
}

#[derive(Debug, Clone, Default)]
pub struct PauseToken {
    inner: Arc<(Mutex<PauseState>, Condvar)>,
}

impl PauseToken {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PauseState> {
        self.inner
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused()
    }

    /// True only for the UI hold, not for structural edits in progress.
    pub fn is_held(&self) -> bool {
        self.lock().held_by_user
    }

    pub fn pause(&self) {
        self.lock().held_by_user = true;
    }

    pub fn resume(&self) {
        self.lock().held_by_user = false;
        self.inner.1.notify_all();
    }

    /// Blocks new cycles, then waits up to `timeout` for a running one to finish.
    /// Returns `None` if the cycle is still running when the wait expires.
    pub fn exclusive(&self, timeout: Duration) -> Option<ExclusiveGuard> {
        let (_, condvar) = &*self.inner;
        let mut state = self.lock();
        state.holds += 1;
        let (mut state, _) = condvar
            .wait_timeout_while(state, timeout, |state| state.ticking)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.ticking {
            state.holds -= 1;
            return None;
        }
        Some(ExclusiveGuard {
            token: self.clone(),
        })
    }

    pub fn begin_tick(&self, timeout: Duration) -> Option<TickGuard> {
        let (_, condvar) = &*self.inner;
        let state = self.lock();
        let (mut state, _) = condvar
            .wait_timeout_while(state, timeout, |state| state.paused())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.paused() {
            return None;
        }
        state.ticking = true;
        Some(TickGuard {
            token: self.clone(),
        })
    }
}

#[must_use]
pub struct ExclusiveGuard {
    token: PauseToken,
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        let mut state = self.token.lock();
        state.holds = state.holds.saturating_sub(1);
        drop(state);
        self.token.inner.1.notify_all();
    }
}

#[must_use]
pub struct TickGuard {
    token: PauseToken,
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.token.lock().ticking = false;
        self.token.inner.1.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use super::*;

    #[test]
    fn exclusive_blocks_ticks_until_dropped() {
        let token = PauseToken::new();
        let guard = token.exclusive(Duration::from_millis(10)).unwrap();

        assert!(token.is_paused());
        assert!(token.begin_tick(Duration::from_millis(5)).is_none());

        drop(guard);
        assert!(token.begin_tick(Duration::from_millis(5)).is_some());
    }

    #[test]
    fn exclusive_waits_for_running_tick() {
        let token = PauseToken::new();
        let tick = token.begin_tick(Duration::ZERO).unwrap();

        let worker = {
            let token = token.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let guard = token.exclusive(Duration::from_secs(5));
                (guard.is_some(), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        drop(tick);

        let (acquired, waited) = worker.join().unwrap();
        assert!(acquired);
        assert!(waited >= Duration::from_millis(40));
    }

    #[test]
    fn exclusive_gives_up_on_a_stuck_tick() {
        let token = PauseToken::new();
        let _tick = token.begin_tick(Duration::ZERO).unwrap();

        assert!(token.exclusive(Duration::from_millis(10)).is_none());
        assert!(!token.is_paused());
    }

    #[test]
    fn user_hold_survives_until_resume() {
        let token = PauseToken::new();
        token.pause();

        assert!(token.begin_tick(Duration::from_millis(5)).is_none());

        token.resume();
        assert!(token.begin_tick(Duration::ZERO).is_some());
    }
}
