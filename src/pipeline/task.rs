use crate::pipeline::error::PipelineError;
use crate::shared::signal::CancelToken;
use std::io;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

pub type TaskResult = Result<(), PipelineError>;

// A named pipeline component running on its own thread.
// Resources the body owns (serial ports, sinks) are dropped when the thread
// exits, whether it returned normally, failed, or panicked.
pub struct TaskHandle {
    name: String,
    token: CancelToken,
    join: Option<JoinHandle<TaskResult>>,
}

impl TaskHandle {
    pub fn spawn<F>(name: &str, token: CancelToken, body: F) -> io::Result<Self>
    where
        F: FnOnce(CancelToken) -> TaskResult + Send + 'static,
    {
        let for_body = token.clone();
        let thread_name = name.to_string();
        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                info!(task = %thread_name, "task started");
                let result = body(for_body);
                info!(task = %thread_name, ok = result.is_ok(), "task finished");
                result
            })?;
        Ok(Self {
            name: name.to_string(),
            token,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // Request a stop at the task's next loop boundary. Safe to call repeatedly.
    pub fn stop(&self) {
        debug!(task = %self.name, "stop requested");
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    // Wait for the thread and return its result; a second join returns Ok.
    pub fn join(&mut self) -> TaskResult {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        match join.join() {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Panicked(self.name.clone())),
        }
    }
}

impl Drop for TaskHandle {
    // Never leave a detached loop behind when the handle goes away.
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stop_twice_then_join() {
        let mut task = TaskHandle::spawn("looper", CancelToken::new(), |token| {
            while !token.wait_timeout(Duration::from_millis(5)) {}
            Ok(())
        })
        .expect("spawn");

        task.stop();
        task.stop();
        assert!(task.join().is_ok());
        assert!(task.is_finished());
        assert!(task.join().is_ok());
    }

    #[test]
    fn errors_and_panics_reach_the_joiner() {
        let mut failing = TaskHandle::spawn("failing", CancelToken::new(), |_| {
            Err(PipelineError::QueueClosed)
        })
        .expect("spawn");
        assert!(matches!(failing.join(), Err(PipelineError::QueueClosed)));

        let mut panicking = TaskHandle::spawn("panicking", CancelToken::new(), |_| {
            panic!("boom");
        })
        .expect("spawn");
        assert!(matches!(panicking.join(), Err(PipelineError::Panicked(name)) if name == "panicking"));
    }
}
