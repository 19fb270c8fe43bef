//! Handler of the holepunch messages, we act as the relay for the remote and
//! connect to the endpoints that relays give us.

use std::{net::SocketAddr, sync::atomic::Ordering};

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    extensions::{
        ExtMsgHandler, ExtensionKind, HolepunchErrorCodes, HolepunchMsg,
        HolepunchMsgType,
    },
    peer::{MsgHandler, Peer, PeerMsg, PeerSource},
    torrent::TorrentMsg,
};

impl ExtMsgHandler<HolepunchMsg> for MsgHandler {
    async fn handle_msg(
        &self,
        peer: &mut Peer,
        msg: HolepunchMsg,
    ) -> Result<(), Error> {
        if !peer.ext.supports(ExtensionKind::Holepunch) {
            return Ok(());
        }

        let remote = peer.ctx.remote_addr;

        match msg.msg_type {
            HolepunchMsgType::Rendezvous => {
                let target = msg.addr;
                debug!("{remote} rendezvous with {target}");

                let local = SocketAddr::new(
                    peer.ctx.local_addr.ip(),
                    peer.torrent_ctx.local_port,
                );
                if target == local || target == peer.ctx.local_addr {
                    let err = HolepunchMsg::error(target, HolepunchErrorCodes::NoSelf);
                    return peer.send_ext(ExtensionKind::Holepunch, &err).await;
                }

                let (otx, orx) = oneshot::channel();
                peer.torrent_ctx
                    .tx
                    .send(TorrentMsg::ReadPeerByAddr(target, otx))
                    .await?;

                let Some(target_ctx) = orx.await? else {
                    let err = HolepunchMsg::error(
                        target,
                        HolepunchErrorCodes::NotConnected,
                    );
                    return peer.send_ext(ExtensionKind::Holepunch, &err).await;
                };

                if !target_ctx.supports_holepunch.load(Ordering::Relaxed) {
                    let err =
                        HolepunchMsg::error(target, HolepunchErrorCodes::NoSupport);
                    return peer.send_ext(ExtensionKind::Holepunch, &err).await;
                }

                // send connect to the target, with the endpoint of the src
                if !relay_connect(&target_ctx.tx, peer.ctx.listen_addr()) {
                    let err = HolepunchMsg::error(
                        target,
                        HolepunchErrorCodes::NotConnected,
                    );
                    return peer.send_ext(ExtensionKind::Holepunch, &err).await;
                }

                // send connect to the src, with the endpoint of the target
                peer.send_ext(
                    ExtensionKind::Holepunch,
                    &HolepunchMsg::connect(target_ctx.listen_addr()),
                )
                .await?;
            }
            HolepunchMsgType::Connect => {
                info!("{remote} introduced us to {}", msg.addr);
                peer.torrent_ctx
                    .tx
                    .send(TorrentMsg::AddPeers(
                        vec![msg.addr],
                        PeerSource::Holepunch,
                    ))
                    .await?;
            }
            HolepunchMsgType::Error => {
                warn!(
                    "{remote} could not relay to {}: {:?}",
                    msg.addr, msg.err_code
                );
            }
        }

        Ok(())
    }
}

/// Give the endpoint of the src to the connection of the target, without
/// waiting on it. False when the target is gone or too busy.
fn relay_connect(target: &mpsc::Sender<PeerMsg>, src: SocketAddr) -> bool {
    match target.try_send(PeerMsg::Holepunch(HolepunchMsg::connect(src))) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            debug!("target of {src} is busy, dropping the rendezvous");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!("target of {src} closed before the rendezvous");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_never_waits_on_the_target() {
        let src: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(1);

        assert!(relay_connect(&tx, src));
        // full
        assert!(!relay_connect(&tx, src));

        match rx.try_recv() {
            Ok(PeerMsg::Holepunch(msg)) => {
                assert_eq!(msg, HolepunchMsg::connect(src))
            }
            r => panic!("unexpected {r:?}"),
        }
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!relay_connect(&tx, src));
    }
}
