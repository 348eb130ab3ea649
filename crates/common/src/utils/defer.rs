/// Runs the wrapped closure when dropped, unless [`Defer::cancel`] was called first.
pub struct Defer<F: FnOnce()>(Option<F>);

pub fn defer<F: FnOnce()>(f: F) -> Defer<F> {
    Defer(Some(f))
}

impl<F: FnOnce()> Defer<F> {
    /// Disarms the guard; the closure will never run.
    pub fn cancel(mut self) {
        self.0.take();
    }
}

impl<F> Drop for Defer<F>
where
    F: FnOnce(),
{
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn runs_on_drop() {
        let hit = Cell::new(false);
        {
            let _guard = defer(|| hit.set(true));
        }
        assert!(hit.get());
    }

    #[test]
    fn cancel_disarms() {
        let hit = Cell::new(false);
        let guard = defer(|| hit.set(true));
        guard.cancel();
        assert!(!hit.get());
    }
}
