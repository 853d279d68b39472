//! Checkpoint challenge for new outbound peers
//!
//! The peer must return exactly the checkpoint header, and, when it
//! advertises compact filters, a filter-header chain ending at the
//! checkpoint's filter header. A single differing byte fails the peer.

use crate::config::Checkpoint;
use crate::crypto::Hash256;
use crate::network::message::{
    chain_filter_headers, BlockHeader, Message, BASIC_FILTER,
};
use crate::network::peer::PeerError;

/// Outstanding checkpoint responses
#[derive(Debug, Clone)]
pub struct Challenge {
    checkpoint: Checkpoint,
    header_ok: bool,
    /// `None` when the peer does not serve filters
    filters_ok: Option<bool>,
}

impl Challenge {
    pub fn new(checkpoint: Checkpoint, with_filters: bool) -> Self {
        Self {
            checkpoint,
            header_ok: false,
            filters_ok: with_filters.then_some(false),
        }
    }

    /// Requests to send when the challenge starts
    pub fn requests(&self) -> Vec<Message> {
        let mut requests = vec![Message::GetHeaders {
            locator: Vec::new(),
            stop: self.checkpoint.header_hash,
        }];
        if self.filters_ok.is_some() {
            requests.push(Message::GetCFHeaders {
                filter_type: BASIC_FILTER,
                start_height: self.checkpoint.height,
                stop_hash: self.checkpoint.header_hash,
            });
        }
        requests
    }

    /// All required responses arrived and matched
    pub fn is_satisfied(&self) -> bool {
        self.header_ok && self.filters_ok.unwrap_or(true)
    }

    pub fn on_headers(&mut self, headers: &[BlockHeader]) -> Result<(), PeerError> {
        if self.header_ok {
            return Err(PeerError::Protocol("unsolicited headers".to_string()));
        }
        let header = match headers {
            [header] => header,
            _ => {
                return Err(PeerError::Checkpoint(format!(
                    "expected one header, got {}",
                    headers.len()
                )))
            }
        };

        let hash = header.block_hash();
        if hash != self.checkpoint.header_hash {
            return Err(PeerError::Checkpoint(format!(
                "header {} at height {}, expected {}",
                hash, self.checkpoint.height, self.checkpoint.header_hash
            )));
        }
        self.header_ok = true;
        Ok(())
    }

    pub fn on_cfheaders(
        &mut self,
        filter_type: u8,
        stop_hash: &Hash256,
        previous: &Hash256,
        filter_hashes: &[Hash256],
    ) -> Result<(), PeerError> {
        match self.filters_ok {
            Some(false) => {}
            _ => return Err(PeerError::Protocol("unsolicited cfheaders".to_string())),
        }
        if filter_type != BASIC_FILTER || *stop_hash != self.checkpoint.header_hash {
            return Err(PeerError::Checkpoint(format!(
                "filter headers for type {} up to {}",
                filter_type, stop_hash
            )));
        }

        let last = chain_filter_headers(previous, filter_hashes).pop();
        match last {
            Some(last) if last == self.checkpoint.filter_header_hash => {
                self.filters_ok = Some(true);
                Ok(())
            }
            Some(last) => Err(PeerError::Checkpoint(format!(
                "filter header {}, expected {}",
                last, self.checkpoint.filter_header_hash
            ))),
            None => Err(PeerError::Checkpoint("empty filter header response".to_string())),
        }
    }
}
