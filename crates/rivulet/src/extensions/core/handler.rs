use std::sync::atomic::Ordering;

use tracing::debug;

use crate::{
    error::Error,
    extensions::{Core, ExtMsgHandler},
    peer::{MsgHandler, Peer},
};

impl ExtMsgHandler<Core> for MsgHandler {
    async fn handle_msg(&self, peer: &mut Peer, msg: Core) -> Result<(), Error> {
        let remote = peer.ctx.remote_addr;

        match msg {
            // dispatched by the peer to the handler of each extension
            Core::Extended(_) => {}
            Core::KeepAlive => {
                debug!("{remote} < keepalive");
            }
            Core::Port(port) => {
                debug!("{remote} < port {port}");
            }
            Core::Bitfield(bitfield) => {
                debug!(
                    "{remote} < bitfield len: {} ones: {}",
                    bitfield.len(),
                    bitfield.count_ones()
                );
                peer.remote_bitfield(bitfield).await?;
            }
            Core::Have(piece) => {
                debug!("{remote} < have {piece}");
                peer.remote_have(piece).await?;
            }
            Core::Unchoke => {
                debug!("{remote} < unchoke");
                peer.ctx.peer_choking.store(false, Ordering::Relaxed);
                if peer.can_request() {
                    peer.request_blocks().await?;
                }
            }
            Core::Choke => {
                debug!("{remote} < choke");
                peer.ctx.peer_choking.store(true, Ordering::Relaxed);
                peer.free_pending_blocks();
            }
            Core::Interested => {
                // remote peer is interested in the local peer
                debug!("{remote} < interested");
                peer.ctx.peer_interested.store(true, Ordering::Relaxed);
                peer.try_unchoke().await?;
            }
            Core::NotInterested => {
                debug!("{remote} < not_interested");
                peer.ctx.peer_interested.store(false, Ordering::Relaxed);
                peer.choke().await?;
            }
            Core::Piece(block) => {
                peer.handle_block(block).await?;
            }
            Core::Request(block_info) => {
                debug!("{remote} < request {block_info:?}");
                peer.queue_request(block_info);
            }
            Core::Cancel(block_info) => {
                debug!("{remote} < cancel {block_info:?}");
                peer.incoming_requests.retain(|v| *v != block_info);
            }
        }

        Ok(())
    }
}
