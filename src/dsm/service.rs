//! Inbound side of the DSM protocol: serves requests from peer engines.

use async_trait::async_trait;

use super::array::Array;
use super::error::{DsmError, DsmResult};
use super::manager::MemoryManager;
use super::protocol::{self, DsmRequest, DsmResponse};
use super::types::{LeaseId, LeaseType, PageId};
use crate::transport::{MessageHandler, StreamKind};

impl MemoryManager {
    /// Executes one decoded request against local state.
    pub async fn serve_request(&self, request: DsmRequest) -> DsmResult<DsmResponse> {
        match request {
            DsmRequest::FetchPage { array, page, .. } => {
                let array = self.get_array(&array)?;
                self.require_owner(&array, page)?;
                let page_ref = self.local_page(&array, page);
                let page = page_ref.read();
                Ok(DsmResponse::Page {
                    version: page.version,
                    data: page.to_bytes(),
                })
            }

            DsmRequest::PushPage {
                array,
                page,
                lease,
                data,
                ..
            } => {
                let array = self.get_array(&array)?;
                self.require_owner(&array, page)?;
                self.require_write_lease(&array, page, &lease).await?;
                let version = self.commit_local(&array, page, data)?;
                Ok(DsmResponse::Version(version))
            }

            DsmRequest::AcquireLease {
                array,
                page,
                lease_type,
                owner,
                version,
                lease,
            } => {
                let array = self.get_array(&array)?;
                self.require_home(&array)?;
                let (lease, owner) =
                    self.grant_lease(&array, page, lease_type, &owner, version, lease)?;
                Ok(DsmResponse::LeaseGranted { lease, owner })
            }

            DsmRequest::WithdrawLease { array, page, lease } => {
                let array = self.get_array(&array)?;
                self.require_home(&array)?;
                self.withdraw_grant(&array, page, &lease);
                Ok(DsmResponse::Ack)
            }

            DsmRequest::ReleaseLease { lease } => {
                self.leases.release_lease(&lease)?;
                Ok(DsmResponse::Ack)
            }

            DsmRequest::ValidateLease { lease } => {
                Ok(DsmResponse::Lease(self.leases.validate_lease(&lease)?))
            }

            DsmRequest::RevokeLease { array, page } => {
                self.leases.revoke_lease(&array, page);
                Ok(DsmResponse::Ack)
            }

            DsmRequest::Invalidate { array, pages } => {
                let dropped = self.invalidate_local(&array, &pages);
                tracing::debug!(array = %array, "Invalidated {} cached page(s)", dropped);
                Ok(DsmResponse::Ack)
            }

            DsmRequest::BumpVersion { array } => {
                let array = self.get_array(&array)?;
                self.require_home(&array)?;
                Ok(DsmResponse::Version(array.bump_version()))
            }

            DsmRequest::AnnounceArray { descriptor } => {
                self.register_array(descriptor)?;
                Ok(DsmResponse::Ack)
            }

            DsmRequest::DropArray { array } => {
                if self.drop_local(&array).is_some() {
                    tracing::info!(array = %array, "Dropped array deleted by a peer");
                }
                Ok(DsmResponse::Ack)
            }
        }
    }

    fn require_owner(&self, array: &Array, page: PageId) -> DsmResult<()> {
        array.check_page(page)?;
        match array.owner(page) {
            Some(owner) if owner == self.local => Ok(()),
            _ => Err(DsmError::Protocol(format!(
                "{} does not own page {}/{}",
                self.local, array.id, page
            ))),
        }
    }

    /// Checks with the home that `lease` is a live Write lease on this page.
    async fn require_write_lease(
        &self,
        array: &Array,
        page: PageId,
        lease: &LeaseId,
    ) -> DsmResult<()> {
        let cancel = self.child_token();
        let lease = self.validate_at_home(array, lease, &cancel).await?;
        if lease.lease_type != LeaseType::Write || lease.array != array.id || lease.page != page {
            return Err(DsmError::Protocol(format!(
                "{} lease {} does not cover writes to page {}/{}",
                lease.lease_type, lease.id, array.id, page
            )));
        }
        Ok(())
    }

    fn require_home(&self, array: &Array) -> DsmResult<()> {
        if array.home != self.local {
            return Err(DsmError::Protocol(format!(
                "{} is not the home of array {}",
                self.local, array.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for MemoryManager {
    async fn handle_message(&self, kind: StreamKind, data: Vec<u8>) -> Vec<u8> {
        let response = match protocol::decode_request(&data) {
            Ok(request) if request.stream_kind() != kind => DsmResponse::Error(DsmError::Protocol(
                format!("request {} sent on a {:?} stream", request.kind_code(), kind),
            )),
            Ok(request) => match self.serve_request(request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!("Request failed: {}", e);
                    DsmResponse::Error(e)
                }
            },
            Err(e) => {
                tracing::error!("Malformed DSM request: {}", e);
                DsmResponse::Error(e)
            }
        };

        match protocol::encode_response(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to encode DSM response: {}", e);
                protocol::encode_response(&DsmResponse::Error(e)).unwrap_or_default()
            }
        }
    }
}
