//! Handler of the extended handshake.

use std::sync::atomic::Ordering;

use tracing::{debug, info};

use crate::{
    error::Error,
    extensions::{ExtMsgHandler, Extension, ExtensionKind},
    peer::{MsgHandler, Peer},
};

impl ExtMsgHandler<Extension> for MsgHandler {
    async fn handle_msg(
        &self,
        peer: &mut Peer,
        ext: Extension,
    ) -> Result<(), Error> {
        info!(
            "{} extended handshake from {:?}",
            peer.ctx.remote_addr,
            ext.v.as_deref().unwrap_or("?")
        );
        debug!("{ext:?}");

        peer.ext.update(&ext);

        // the max number of block_infos to request
        if let Some(reqq) = ext.reqq {
            peer.session.set_remote_reqq(reqq);
        }

        if let Some(p) = ext.p {
            peer.ctx.listen_port.store(p, Ordering::Relaxed);
        }

        peer.ctx
            .supports_holepunch
            .store(peer.ext.supports(ExtensionKind::Holepunch), Ordering::Relaxed);

        if peer.torrent_ctx.content().is_none() {
            match ext.metadata_size {
                Some(size) if peer.ext.supports(ExtensionKind::Metadata) => {
                    peer.torrent_ctx.init_metadata(size);
                }
                _ => debug!(
                    "{} cannot give us the info of the torrent",
                    peer.ctx.remote_addr
                ),
            }
        }

        Ok(())
    }
}
