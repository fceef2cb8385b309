//! In-process tree transport over tokio channels.
//!
//! Every party gets an [`Endpoint`]: one FIFO link to its parent, one to
//! each child, and a shared done signal. Frames cross the links as encoded
//! bytes, so a receiver decodes exactly what a remote peer would.

use std::time::Duration;

use log::debug;
use tokio::sync::{mpsc, watch};

use crate::error::{Result, SessionError};
use crate::wire::{Frame, MessageType};

/// Bytes from a child, tagged with the child's party id.
type ChildBytes = (usize, Vec<u8>);

pub struct Endpoint {
    pub id: usize,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    to_parent: Option<mpsc::UnboundedSender<ChildBytes>>,
    from_parent: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    to_children: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    from_children: mpsc::UnboundedReceiver<ChildBytes>,
    done: watch::Receiver<bool>,
}

/// Owner side of the done signal.
#[derive(Clone)]
pub struct DoneSignal {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl DoneSignal {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Parent of party `i` is `(i − 1) / fan_out`; party 0 is the root.
pub fn parent_of(i: usize, fan_out: usize) -> Option<usize> {
    (i > 0).then(|| (i - 1) / fan_out)
}

/// Build the endpoints of a `parties`-node tree with the given fan-out.
pub fn tree(parties: usize, fan_out: usize) -> (Vec<Endpoint>, DoneSignal) {
    let (done_tx, done_rx) = watch::channel(false);

    let mut up = Vec::with_capacity(parties);
    let mut up_rx = Vec::with_capacity(parties);
    for _ in 0..parties {
        let (tx, rx) = mpsc::unbounded_channel();
        up.push(tx);
        up_rx.push(rx);
    }

    let mut endpoints: Vec<Endpoint> = up_rx
        .into_iter()
        .enumerate()
        .map(|(id, rx)| Endpoint {
            id,
            parent: parent_of(id, fan_out),
            children: Vec::new(),
            to_parent: None,
            from_parent: None,
            to_children: Vec::new(),
            from_children: rx,
            done: done_rx.clone(),
        })
        .collect();

    for id in 1..parties {
        let Some(parent) = parent_of(id, fan_out) else { continue };
        let (down_tx, down_rx) = mpsc::unbounded_channel();
        endpoints[parent].children.push(id);
        endpoints[parent].to_children.push(down_tx);
        endpoints[id].from_parent = Some(down_rx);
        endpoints[id].to_parent = Some(up[parent].clone());
    }

    (
        endpoints,
        DoneSignal {
            tx: std::sync::Arc::new(done_tx),
        },
    )
}

impl Endpoint {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn cancelled(&self) -> bool {
        *self.done.borrow()
    }

    pub fn send_to_parent(&self, frame: &Frame) -> Result<()> {
        let tx = self.to_parent.as_ref().ok_or(SessionError::ChannelClosed("parent"))?;
        tx.send((self.id, frame.encode()?))
            .map_err(|_| SessionError::ChannelClosed("parent"))
    }

    /// Send the same encoded frame to every child.
    pub fn broadcast(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode()?;
        for tx in &self.to_children {
            tx.send(bytes.clone())
                .map_err(|_| SessionError::ChannelClosed("child"))?;
        }
        Ok(())
    }

    /// Next frame from the parent; a frame that fails to decode is an error.
    pub async fn recv_from_parent(&mut self, timeout: Duration) -> Result<Frame> {
        let rx = self
            .from_parent
            .as_mut()
            .ok_or(SessionError::ChannelClosed("parent"))?;
        let bytes = wait(&mut self.done, rx.recv(), timeout)
            .await?
            .ok_or(SessionError::ChannelClosed("parent"))?;
        let (frame, _) = Frame::decode(&bytes)?;
        Ok(frame)
    }

    /// Next message from any child, still encoded, so the caller decides
    /// what a malformed contribution costs.
    pub async fn recv_from_child(&mut self, timeout: Duration) -> Result<ChildBytes> {
        let msg = wait(&mut self.done, self.from_children.recv(), timeout).await?;
        let msg = msg.ok_or(SessionError::ChannelClosed("child"))?;
        debug!("party {} received {} bytes from {}", self.id, msg.1.len(), msg.0);
        Ok(msg)
    }

    /// Expect a frame of type `want` from the parent.
    pub async fn expect_from_parent(&mut self, want: MessageType, timeout: Duration) -> Result<Frame> {
        let frame = self.recv_from_parent(timeout).await?;
        if frame.msg_type != want {
            return Err(SessionError::UnexpectedMessage {
                want,
                got: frame.msg_type,
            });
        }
        Ok(frame)
    }
}

async fn wait<T>(
    done: &mut watch::Receiver<bool>,
    recv: impl std::future::Future<Output = Option<T>>,
    timeout: Duration,
) -> Result<Option<T>> {
    if *done.borrow() {
        return Err(SessionError::Cancelled);
    }
    tokio::select! {
        // a raised signal and a dropped owner both end the run
        _ = done.changed() => Err(SessionError::Cancelled),
        got = tokio::time::timeout(timeout, recv) => {
            got.map_err(|_| SessionError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_shape() {
        assert_eq!(parent_of(0, 2), None);
        assert_eq!(parent_of(1, 2), Some(0));
        assert_eq!(parent_of(2, 2), Some(0));
        assert_eq!(parent_of(3, 2), Some(1));
        assert_eq!(parent_of(4, 1), Some(3));

        let (eps, _) = tree(5, 2);
        assert!(eps[0].is_root());
        assert_eq!(eps[0].children, vec![1, 2]);
        assert_eq!(eps[1].children, vec![3, 4]);
        assert_eq!(eps[4].parent, Some(1));
        assert!(eps[4].children.is_empty());
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (mut eps, _done) = tree(2, 2);
        let mut child = eps.pop().unwrap();
        let mut root = eps.pop().unwrap();
        let t = Duration::from_secs(1);

        root.broadcast(&Frame::new(MessageType::Sync, vec![])).unwrap();
        let f = child.expect_from_parent(MessageType::Sync, t).await.unwrap();
        assert!(f.payload.is_empty());

        child.send_to_parent(&Frame::new(MessageType::LocalGradient, vec![1])).unwrap();
        let (from, bytes) = root.recv_from_child(t).await.unwrap();
        assert_eq!(from, 1);
        assert_eq!(Frame::decode(&bytes).unwrap().0.payload, vec![1]);

        assert!(root.send_to_parent(&Frame::new(MessageType::Sync, vec![])).is_err());
    }

    #[tokio::test]
    async fn silence_times_out_and_cancel_wins() {
        let (mut eps, done) = tree(2, 2);
        let mut child = eps.pop().unwrap();
        let err = child
            .recv_from_parent(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));

        done.cancel();
        assert!(child.cancelled());
        let err = child.recv_from_parent(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
    }

    #[tokio::test]
    async fn dropped_done_signal_cancels() {
        let (mut eps, done) = tree(2, 2);
        let mut child = eps.pop().unwrap();
        drop(done);
        let err = child.recv_from_parent(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
    }
}
