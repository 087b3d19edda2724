//! In-memory link pair
//!
//! Frames written to one end arrive on the other. Closing or aborting one
//! end delivers a `Closed` event to the other.

use tokio::sync::mpsc;
use tracing::debug;

use super::{link, Link, LinkControl, LinkEvent, LinkState};
use crate::codec::TransportKind;

/// Two connected links
pub fn pair(kind: TransportKind) -> (Link, Link) {
    let (a, a_driver) = link(kind);
    let (b, b_driver) = link(kind);

    bridge(a_driver.outbound, a_driver.control, b_driver.inbound);
    bridge(b_driver.outbound, b_driver.control, a_driver.inbound);

    (a, b)
}

fn bridge(mut from: mpsc::Receiver<Vec<u8>>, control: LinkControl, to: mpsc::Sender<LinkEvent>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                frame = from.recv() => match frame {
                    Some(frame) => {
                        if to.send(LinkEvent::Frame(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = to.send(LinkEvent::Closed(None)).await;
                        break;
                    }
                },

                _ = control.closed() => {
                    let error = match control.state() {
                        LinkState::Failed(e) => Some(e),
                        _ => None,
                    };
                    debug!("In-memory link closed ({:?})", error);
                    let _ = to.send(LinkEvent::Closed(error)).await;
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[tokio::test]
    async fn test_frames_cross() {
        let (a, mut b) = pair(TransportKind::Json);
        a.sender.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(b.receiver.recv().await, LinkEvent::Frame(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_close_reaches_peer() {
        let (a, mut b) = pair(TransportKind::Json);
        a.sender.send(b"last".to_vec()).await.unwrap();
        a.control.close();
        assert_eq!(b.receiver.recv().await, LinkEvent::Frame(b"last".to_vec()));
        assert_eq!(b.receiver.recv().await, LinkEvent::Closed(None));
    }

    #[tokio::test]
    async fn test_abort_reaches_peer() {
        let (a, mut b) = pair(TransportKind::Json);
        a.control.abort(TransportError::Reset("cable cut".into()));
        assert_eq!(
            b.receiver.recv().await,
            LinkEvent::Closed(Some(TransportError::Reset("cable cut".into())))
        );
    }
}
