//! Typed completion dispatch shared by both streaming endpoints.
//!
//! Every asynchronous stream operation is issued as its own task whose only
//! job is to run the operation and post a typed completion event. A single
//! dispatch loop per endpoint pulls completions and hands them to the
//! stream's state machine, which advances by issuing the next operation.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// What the state machine does after handling one completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep pulling completions.
    Continue,
    /// The stream is over; stop the dispatch loop.
    Finished,
}

/// Per-stream state machine fed by [`run`].
#[async_trait]
pub trait EventHandler {
    type Event: Send + 'static;

    async fn on_event(&mut self, event: Self::Event) -> Flow;
}

/// Run `op` in its own task and post its completion to the dispatch channel.
/// The completion is dropped when the dispatcher has already exited.
pub fn issue<E, F>(completions: &mpsc::UnboundedSender<E>, op: F)
where
    E: Send + 'static,
    F: Future<Output = E> + Send + 'static,
{
    let completions = completions.clone();
    tokio::spawn(async move {
        let _ = completions.send(op.await);
    });
}

/// Pull completions and hand them to the state machine until it reports
/// [`Flow::Finished`] or the channel closes.
pub async fn run<H>(handler: &mut H, completions: &mut mpsc::UnboundedReceiver<H::Event>)
where
    H: EventHandler + Send,
{
    while let Some(event) = completions.recv().await {
        if handler.on_event(event).await == Flow::Finished {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown {
        seen: Vec<u32>,
        finish_at: u32,
    }

    #[async_trait]
    impl EventHandler for Countdown {
        type Event = u32;

        async fn on_event(&mut self, event: u32) -> Flow {
            self.seen.push(event);
            if event == self.finish_at {
                Flow::Finished
            } else {
                Flow::Continue
            }
        }
    }

    #[tokio::test]
    async fn stops_on_finished() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for event in [1u32, 2, 3, 4] {
            tx.send(event).unwrap();
        }

        let mut handler = Countdown {
            seen: Vec::new(),
            finish_at: 3,
        };
        run(&mut handler, &mut rx).await;

        // The fourth completion stays in the channel, unconsumed.
        assert_eq!(handler.seen, vec![1, 2, 3]);
        assert_eq!(rx.try_recv().unwrap(), 4);
    }

    #[tokio::test]
    async fn stops_when_the_channel_closes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(1u32).unwrap();
        tx.send(2u32).unwrap();
        drop(tx);

        let mut handler = Countdown {
            seen: Vec::new(),
            finish_at: u32::MAX,
        };
        run(&mut handler, &mut rx).await;

        assert_eq!(handler.seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn issued_operations_post_their_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        issue(&tx, async { 7u32 });

        let mut handler = Countdown {
            seen: Vec::new(),
            finish_at: 7,
        };
        run(&mut handler, &mut rx).await;

        assert_eq!(handler.seen, vec![7]);
    }
}
