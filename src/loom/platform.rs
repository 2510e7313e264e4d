//! Spin-wait primitives shared by blocking and async waits.

/// Spins before a busy-poll loop starts yielding the thread.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Backs off between two polls of a device runtime.
#[inline]
pub fn relax(iteration: u32) {
    if iteration < SPINS_BEFORE_YIELD {
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

/// Yields to the executor between two polls of an async wait. Works on any executor.
#[inline]
pub async fn yield_now() {
    tokio::task::yield_now().await
}
