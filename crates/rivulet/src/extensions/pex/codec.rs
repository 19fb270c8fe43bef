//! Handler of the PEX messages.

use tracing::debug;

use crate::{
    error::Error,
    extensions::{ExtMsgHandler, ExtensionKind, PexMsg},
    peer::{MsgHandler, Peer, PeerSource},
    torrent::TorrentMsg,
};

impl ExtMsgHandler<PexMsg> for MsgHandler {
    async fn handle_msg(&self, peer: &mut Peer, msg: PexMsg) -> Result<(), Error> {
        if !peer.ext.supports(ExtensionKind::Pex) {
            return Ok(());
        }

        debug!(
            "{} pex added {} dropped {}",
            peer.ctx.remote_addr,
            msg.added.len(),
            msg.dropped.len()
        );

        let peers: Vec<_> = msg
            .added
            .into_iter()
            .map(|(addr, _)| addr)
            .filter(|addr| addr.port() != 0 && *addr != peer.ctx.remote_addr)
            .collect();

        if !peers.is_empty() {
            peer.torrent_ctx
                .tx
                .send(TorrentMsg::AddPeers(peers, PeerSource::Pex))
                .await?;
        }

        Ok(())
    }
}
