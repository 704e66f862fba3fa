//! Cooperative yielding
//!
//! Label functions call `maybe_yield` at designated safepoints. Once the
//! cooperation budget (20 ms by default) has elapsed, the fiber snapshots its
//! position, installs a loop lock, and schedules a short-delay continuation so
//! the host event loop gets serviced. Resumes arriving during the lock window
//! are parked on the wait list and replayed when the continuation flushes.

use std::rc::Rc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::errors::RuntimeError;
use crate::values::Value;

use super::exec_loop::exec_loop;
use super::frame::FrameRef;
use super::resume::{get_resume, setup_resume};
use super::Runtime;

/// Yield to the host if the cooperation budget is spent. Returns true when
/// the caller must exit the loop; the frame will be re-entered at `pc`.
pub fn maybe_yield(rt: &Rc<Runtime>, s: &FrameRef, pc: i32, r0: Value) -> bool {
    let now = Instant::now();
    if now.duration_since(rt.last_yield()) < Duration::from_millis(rt.config().yield_period_ms) {
        return false;
    }
    rt.set_last_yield(now);

    {
        let mut f = s.borrow_mut();
        f.pc = pc;
        f.r0 = r0;
    }

    let token = rt.install_loop_lock();
    let delay = Duration::from_millis(rt.config().yield_delay_ms);
    let rt = rt.clone();
    let s = s.clone();
    tokio::task::spawn_local(async move {
        sleep(delay).await;
        rt.release_loop_lock(token);
        if rt.is_dead() {
            return;
        }
        rt.bind_current();
        exec_loop(&rt, Some(s));
        rt.flush_loop_lock();
    });
    true
}

/// Park the fiber for `ms` milliseconds, then resume with Null. This is the
/// pause primitive programs use; trace mode reuses it. A zero pause still
/// bounces through the scheduler, so it remains a suspension point.
pub fn thread_pause(
    rt: &Rc<Runtime>,
    s: &FrameRef,
    ret_pc: i32,
    ms: u64,
) -> Result<Option<FrameRef>, RuntimeError> {
    setup_resume(rt, s, ret_pc)?;
    let resume = get_resume(rt)?;
    tokio::task::spawn_local(async move {
        if ms > 0 {
            sleep(Duration::from_millis(ms)).await;
        }
        resume.resolve(Value::Null);
    });
    Ok(None)
}
