//! Handler of the metadata protocol messages.

use tracing::{debug, info, warn};

use crate::{
    error::Error,
    extensions::{ExtMsgHandler, ExtensionKind, MetadataMsg, MetadataProgress},
    peer::{MsgHandler, Peer},
    torrent::TorrentMsg,
};

impl ExtMsgHandler<MetadataMsg> for MsgHandler {
    async fn handle_msg(
        &self,
        peer: &mut Peer,
        msg: MetadataMsg,
    ) -> Result<(), Error> {
        let remote = peer.ctx.remote_addr;

        if !peer.ext.supports(ExtensionKind::Metadata) {
            debug!("{remote} sent ut_metadata without advertising it");
            return Ok(());
        }

        match msg {
            MetadataMsg::Request(piece) => {
                debug!("{remote} metadata req {piece}");

                let data = peer
                    .torrent_ctx
                    .content()
                    .and_then(|c| MetadataMsg::data(piece, &c.raw_info));

                match data {
                    Some(data) => {
                        peer.send_ext(ExtensionKind::Metadata, &data).await?
                    }
                    None => {
                        debug!("{remote} rejecting metadata piece {piece}");
                        peer.send_ext(
                            ExtensionKind::Metadata,
                            &MetadataMsg::Reject(piece),
                        )
                        .await?;
                    }
                }
            }
            MetadataMsg::Data { piece, total_size, payload } => {
                debug!("{remote} metadata data {piece}");
                peer.metadata_requests.remove(&piece);

                let progress =
                    peer.torrent_ctx.insert_metadata(piece, total_size, &payload);

                match progress {
                    MetadataProgress::Complete(raw_info) => {
                        info!("{remote} completed the info of the torrent");
                        peer.torrent_ctx
                            .tx
                            .send(TorrentMsg::InfoComplete(raw_info))
                            .await?;
                    }
                    MetadataProgress::Mismatch => {
                        warn!("{remote} sent the last piece of a bad info");
                    }
                    MetadataProgress::Pending | MetadataProgress::Ignored => {}
                }
            }
            MetadataMsg::Reject(piece) => {
                debug!("{remote} rejected metadata piece {piece}");
                peer.metadata_requests.remove(&piece);
            }
        }

        Ok(())
    }
}
