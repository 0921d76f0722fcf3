//! Contract management
//!
//! Senders spend signed byte budgets; receivers verify them against the
//! local provide keyring. The manager owns the per-destination queues of
//! platform-issued contracts, the exempt-peer policy, and the keyring,
//! and talks to the platform through an injected [`ControlSink`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use trellis_core::{CONTROL_ID, Id, Monitor, MultiHopId, TransferPath};
use trellis_crypto::{ProvideKeyring, ProvideMode};
use trellis_wire::{
    CloseContract, Contract, ControlMessage, CreateContract, CreateContractResult, Frame, Provide,
    ProvideKey, StoredContract,
};

use crate::error::{Result, TransferError};
use crate::settings::ClientSettings;

/// Capability for sending one control frame to the platform
///
/// Injected into the manager so it never needs a handle on the client
/// that owns it.
pub trait ControlSink: Send + Sync {
    /// Enqueue a control message toward the platform
    fn send_control(&self, message: ControlMessage);
}

/// Runtime accounting wrapper over one contract
///
/// The effective budget is the signed budget scaled by the fill
/// fraction; a charge is accepted only while
/// `acked + unacked + charge` stays within it.
pub struct SequenceContract {
    contract: Contract,
    stored: StoredContract,
    effective_transfer_byte_count: u64,
    acked_byte_count: u64,
    unacked_byte_count: u64,
    min_update_byte_count: u64,
}

impl SequenceContract {
    /// Wrap a verified contract
    pub fn new(
        contract: Contract,
        stored: StoredContract,
        fill_fraction: f32,
        min_update_byte_count: u64,
    ) -> Self {
        let fill = fill_fraction.clamp(0.0, 1.0) as f64;
        let effective_transfer_byte_count = (stored.transfer_byte_count as f64 * fill) as u64;
        Self {
            contract,
            stored,
            effective_transfer_byte_count,
            acked_byte_count: 0,
            unacked_byte_count: 0,
            min_update_byte_count,
        }
    }

    /// Contract identifier
    pub fn contract_id(&self) -> Id {
        self.stored.contract_id
    }

    /// Provide mode the contract was signed under
    pub fn provide_mode(&self) -> ProvideMode {
        self.contract.provide_mode
    }

    /// Wire frame installing this contract at the receiver
    pub fn frame(&self) -> Frame {
        self.contract.into_frame()
    }

    /// The charge that `update` would book for `byte_count`
    pub fn charge_for(&self, byte_count: u64) -> u64 {
        byte_count.max(self.min_update_byte_count)
    }

    /// Charge `byte_count`; false when the budget would overflow
    pub fn update(&mut self, byte_count: u64) -> bool {
        let charge = self.charge_for(byte_count);
        let in_flight = self.acked_byte_count + self.unacked_byte_count;
        if in_flight + charge > self.effective_transfer_byte_count {
            return false;
        }
        self.unacked_byte_count += charge;
        true
    }

    /// Settle a previously booked charge
    pub fn ack(&mut self, charge: u64) {
        let settled = charge.min(self.unacked_byte_count);
        self.unacked_byte_count -= settled;
        self.acked_byte_count += settled;
    }

    /// Bytes confirmed delivered
    pub fn acked_byte_count(&self) -> u64 {
        self.acked_byte_count
    }

    /// Bytes charged but unconfirmed
    pub fn unacked_byte_count(&self) -> u64 {
        self.unacked_byte_count
    }

    /// Scaled budget
    pub fn effective_transfer_byte_count(&self) -> u64 {
        self.effective_transfer_byte_count
    }
}

/// Identity of one contract queue
///
/// New code keys by the full tuple; the destination-only abbreviation
/// remains the fallback for abbreviated control-plane responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContractKey {
    /// Destination (or stream) the contracts cover
    pub destination: TransferPath,
    /// Intermediary relays on the path
    pub intermediaries: MultiHopId,
    /// Whether the contracts ride an existing reverse contract
    pub companion: bool,
}

impl ContractKey {
    /// Key for a plain destination
    pub fn to_destination(destination_id: Id) -> Self {
        Self {
            destination: TransferPath::to_destination(destination_id),
            intermediaries: MultiHopId::empty(),
            companion: false,
        }
    }

    /// Destination-only form of this key
    pub fn abbreviated(&self) -> Self {
        Self {
            destination: self.destination,
            intermediaries: MultiHopId::empty(),
            companion: false,
        }
    }
}

#[derive(Default)]
struct ContractQueue {
    pending: HashMap<Id, (Contract, StoredContract)>,
    used_ids: HashSet<Id>,
    open_count: usize,
}

impl ContractQueue {
    /// Add a platform-issued contract; duplicates only refresh pending.
    fn add(&mut self, contract: Contract, stored: StoredContract) -> bool {
        if self.used_ids.contains(&stored.contract_id) {
            return false;
        }
        self.pending.insert(stored.contract_id, (contract, stored));
        true
    }

    fn poll(&mut self) -> Option<(Contract, StoredContract)> {
        let contract_id = *self.pending.keys().next()?;
        let entry = self.pending.remove(&contract_id)?;
        self.used_ids.insert(contract_id);
        Some(entry)
    }

    fn flush(&mut self, reset_used: bool) -> Vec<(Contract, StoredContract)> {
        if reset_used {
            self.used_ids.clear();
        }
        self.pending.drain().map(|(_, entry)| entry).collect()
    }
}

struct ContractManagerState {
    keyring: ProvideKeyring,
    destination_contracts: HashMap<ContractKey, ContractQueue>,
    source_contracts: HashMap<Id, HashSet<Id>>,
    send_no_contract_client_ids: HashSet<Id>,
    receive_no_contract_client_ids: HashSet<Id>,
}

/// Process-wide contract state for one client
pub struct ContractManager {
    client_id: Id,
    settings: Arc<ClientSettings>,
    control: Arc<dyn ControlSink>,
    monitor: Monitor,
    state: Mutex<ContractManagerState>,
}

impl ContractManager {
    /// Create a manager for `client_id`
    pub fn new(
        client_id: Id,
        settings: Arc<ClientSettings>,
        control: Arc<dyn ControlSink>,
    ) -> Self {
        let exempt: HashSet<Id> = [CONTROL_ID, client_id].into_iter().collect();
        Self {
            client_id,
            settings,
            control,
            monitor: Monitor::new(),
            state: Mutex::new(ContractManagerState {
                keyring: ProvideKeyring::new(),
                destination_contracts: HashMap::new(),
                source_contracts: HashMap::new(),
                send_no_contract_client_ids: exempt.clone(),
                receive_no_contract_client_ids: exempt,
            }),
        }
    }

    /// Rotate provide secrets and announce the active set
    pub fn set_provide_modes(&self, modes: &[ProvideMode]) {
        let active = {
            let mut state = self.state.lock();
            state.keyring.set_modes(modes)
        };
        info!(modes = active.len(), "provide modes updated");

        let keys = active
            .into_iter()
            .map(|(mode, secret)| ProvideKey {
                mode,
                secret: Bytes::copy_from_slice(secret.as_bytes()),
            })
            .collect();
        self.control
            .send_control(ControlMessage::Provide(Provide { keys }));
    }

    /// Currently enabled provide modes
    pub fn provide_modes(&self) -> Vec<ProvideMode> {
        self.state.lock().keyring.modes()
    }

    /// Sign a stored contract with the local keyring
    ///
    /// Only meaningful on the providing side; exposed for loopback and
    /// tests standing in for the platform.
    pub fn seal_contract(
        &self,
        stored: &StoredContract,
        mode: ProvideMode,
    ) -> std::result::Result<Contract, trellis_crypto::CryptoError> {
        Contract::seal(stored, mode, &self.state.lock().keyring)
    }

    /// Verify an inbound contract and record its source
    ///
    /// Checks the HMAC under the stated provide mode and that the
    /// contract is addressed to this client (or one of its streams).
    pub fn verify_receive_contract(&self, contract: &Contract) -> Result<StoredContract> {
        let mut state = self.state.lock();
        if !contract.verify(&state.keyring) {
            warn!("inbound contract failed HMAC verification");
            return Err(TransferError::BadContract);
        }
        let stored = contract.stored()?;
        if !stored.destination_id.is_nil() && stored.destination_id != self.client_id {
            warn!(destination = %stored.destination_id, "contract addressed elsewhere");
            return Err(TransferError::BadContract);
        }

        state
            .source_contracts
            .entry(stored.source_id)
            .or_default()
            .insert(stored.contract_id);
        Ok(stored)
    }

    /// Forget a receive-side contract
    pub fn close_receive_contract(&self, source_id: Id, contract_id: Id) {
        let mut state = self.state.lock();
        if let Some(ids) = state.source_contracts.get_mut(&source_id) {
            ids.remove(&contract_id);
            if ids.is_empty() {
                state.source_contracts.remove(&source_id);
            }
        }
    }

    /// Whether `source` may deliver without a contract
    pub fn receive_no_contract(&self, source_id: &Id) -> bool {
        if self.before_enforcement() {
            return true;
        }
        self.state
            .lock()
            .receive_no_contract_client_ids
            .contains(source_id)
    }

    /// Whether sends to `destination` need no contract
    ///
    /// Companion sends are exempt while the destination holds an active
    /// contract into us, so reply paths never mint new quota.
    pub fn send_no_contract(&self, destination_id: &Id, companion: bool) -> bool {
        if self.before_enforcement() {
            return true;
        }
        let state = self.state.lock();
        if state.send_no_contract_client_ids.contains(destination_id) {
            return true;
        }
        companion
            && state
                .source_contracts
                .get(destination_id)
                .is_some_and(|ids| !ids.is_empty())
    }

    /// Exempt a peer in the send direction
    pub fn add_send_no_contract_peer(&self, client_id: Id) {
        self.state.lock().send_no_contract_client_ids.insert(client_id);
    }

    /// Exempt a peer in the receive direction
    pub fn add_receive_no_contract_peer(&self, client_id: Id) {
        self.state
            .lock()
            .receive_no_contract_client_ids
            .insert(client_id);
    }

    /// Keep a queue alive across takes
    pub fn open_contract_queue(&self, key: &ContractKey) {
        let mut state = self.state.lock();
        state
            .destination_contracts
            .entry(key.clone())
            .or_default()
            .open_count += 1;
    }

    /// Release a queue; the last close drops an empty queue
    pub fn close_contract_queue(&self, key: &ContractKey) {
        let mut state = self.state.lock();
        if let Some(queue) = state.destination_contracts.get_mut(key) {
            queue.open_count = queue.open_count.saturating_sub(1);
            if queue.open_count == 0 && queue.pending.is_empty() && queue.used_ids.is_empty() {
                state.destination_contracts.remove(key);
            }
        }
    }

    /// Request a fresh contract from the platform
    pub fn create_contract(&self, key: &ContractKey, transfer_byte_count: u64) {
        let used_contract_ids = {
            let mut state = self.state.lock();
            let queue = state.destination_contracts.entry(key.clone()).or_default();
            queue.used_ids.iter().copied().collect()
        };

        debug!(destination = %key.destination, "requesting contract");
        self.control
            .send_control(ControlMessage::CreateContract(CreateContract {
                destination_id: key.destination.destination_id,
                transfer_byte_count,
                companion: key.companion,
                used_contract_ids,
                stream_id: key.destination.stream_id,
            }));
    }

    /// Accept a platform contract response
    ///
    /// Queue resolution follows the full-tuple key first and falls back
    /// to any open queue with the same destination, accepting responses
    /// issued under the abbreviated legacy key.
    pub fn receive_create_contract_result(&self, result: CreateContractResult) -> bool {
        let Some(contract) = result.contract else {
            if let Some(error) = result.error {
                warn!(error, "contract request refused");
            }
            return false;
        };
        let stored = match contract.stored() {
            Ok(stored) => stored,
            Err(err) => {
                warn!(error = %err, "undecodable contract in response");
                return false;
            }
        };
        // Queues key by the destination mask, not the full signed path.
        let destination = if stored.stream_id.is_nil() {
            TransferPath::to_destination(stored.destination_id)
        } else {
            TransferPath::stream(stored.stream_id)
        };

        let mut state = self.state.lock();
        let key = state
            .destination_contracts
            .keys()
            .find(|key| key.destination == destination && key.intermediaries.is_empty() && !key.companion)
            .or_else(|| {
                state
                    .destination_contracts
                    .keys()
                    .find(|key| key.destination == destination)
            })
            .cloned()
            .unwrap_or(ContractKey {
                destination,
                intermediaries: MultiHopId::empty(),
                companion: false,
            });

        let added = state
            .destination_contracts
            .entry(key)
            .or_default()
            .add(contract, stored);
        drop(state);

        if added {
            self.monitor.notify_all();
        }
        added
    }

    /// Take a pending contract, waiting up to `timeout`
    ///
    /// A zero timeout is a non-blocking try.
    pub async fn take_contract(
        &self,
        key: &ContractKey,
        timeout: Duration,
    ) -> Option<(Contract, StoredContract)> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock();
                if let Some(queue) = state.destination_contracts.get_mut(key) {
                    if let Some(entry) = queue.poll() {
                        return Some(entry);
                    }
                }
            }
            if timeout.is_zero() {
                return None;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return None,
                _ = self.monitor.notified() => continue,
            }
        }
    }

    /// Settle a contract with the platform
    ///
    /// A checkpoint surrenders the contract without erasing its used-id
    /// record; a full close reports final counts.
    pub fn complete_contract(
        &self,
        contract_id: Id,
        acked_byte_count: u64,
        unacked_byte_count: u64,
        checkpoint: bool,
    ) {
        debug!(contract = %contract_id, acked_byte_count, unacked_byte_count, checkpoint, "closing contract");
        self.control
            .send_control(ControlMessage::CloseContract(CloseContract {
                contract_id,
                acked_byte_count,
                unacked_byte_count,
                checkpoint,
            }));
    }

    /// Drain a queue's pending contracts
    pub fn flush_contract_queue(&self, key: &ContractKey, reset_used: bool) {
        let flushed = {
            let mut state = self.state.lock();
            match state.destination_contracts.get_mut(key) {
                Some(queue) => queue.flush(reset_used),
                None => Vec::new(),
            }
        };
        for (_, stored) in flushed {
            self.complete_contract(stored.contract_id, 0, 0, false);
        }
    }

    /// Pending count for a queue (diagnostics)
    pub fn pending_contract_count(&self, key: &ContractKey) -> usize {
        self.state
            .lock()
            .destination_contracts
            .get(key)
            .map(|queue| queue.pending.len())
            .unwrap_or(0)
    }

    fn before_enforcement(&self) -> bool {
        match self.settings.no_contract_until {
            Some(until) => Utc::now() < until,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct RecordingSink {
        messages: PlMutex<Vec<ControlMessage>>,
    }

    impl ControlSink for RecordingSink {
        fn send_control(&self, message: ControlMessage) {
            self.messages.lock().push(message);
        }
    }

    fn manager() -> (Arc<ContractManager>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let manager = Arc::new(ContractManager::new(
            Id::new(),
            Arc::new(ClientSettings::default()),
            sink.clone(),
        ));
        (manager, sink)
    }

    fn issued_contract(
        manager: &ContractManager,
        source_id: Id,
        destination_id: Id,
        transfer_byte_count: u64,
    ) -> (Contract, StoredContract) {
        manager.set_provide_modes(&[ProvideMode::Network]);
        let stored = StoredContract {
            contract_id: Id::new(),
            transfer_byte_count,
            source_id,
            destination_id,
            stream_id: Id::NIL,
        };
        let contract = manager
            .seal_contract(&stored, ProvideMode::Network)
            .unwrap();
        (contract, stored)
    }

    #[test]
    fn test_sequence_contract_accounting() {
        let (manager, _) = manager();
        let (contract, stored) = issued_contract(&manager, Id::new(), manager.client_id, 1000);
        let mut sequence_contract = SequenceContract::new(contract, stored, 1.0, 10);

        // Every accepted charge must stay within the effective budget.
        assert!(sequence_contract.update(400));
        assert!(sequence_contract.update(5)); // charged as min 10
        assert_eq!(sequence_contract.unacked_byte_count(), 410);
        assert!(!sequence_contract.update(600));

        sequence_contract.ack(400);
        assert_eq!(sequence_contract.acked_byte_count(), 400);
        assert_eq!(sequence_contract.unacked_byte_count(), 10);
        // Acked bytes still count against the budget.
        assert!(!sequence_contract.update(600));
        assert!(sequence_contract.update(500));
    }

    #[test]
    fn test_fill_fraction_scales_budget() {
        let (manager, _) = manager();
        let (contract, stored) = issued_contract(&manager, Id::new(), manager.client_id, 1000);
        let mut sequence_contract = SequenceContract::new(contract, stored, 0.5, 1);

        assert_eq!(sequence_contract.effective_transfer_byte_count(), 500);
        assert!(sequence_contract.update(500));
        assert!(!sequence_contract.update(1));
    }

    #[test]
    fn test_verify_receive_contract() {
        let (manager, _) = manager();
        let source_id = Id::new();
        let (contract, stored) = issued_contract(&manager, source_id, manager.client_id, 4096);

        let decoded = manager.verify_receive_contract(&contract).unwrap();
        assert_eq!(decoded, stored);

        // Source now holds a contract into us: companion sends are free.
        assert!(manager.send_no_contract(&source_id, true));
        assert!(!manager.send_no_contract(&source_id, false));

        manager.close_receive_contract(source_id, stored.contract_id);
        assert!(!manager.send_no_contract(&source_id, true));
    }

    #[test]
    fn test_verify_rejects_corrupt_hmac() {
        let (manager, _) = manager();
        let (contract, _) = issued_contract(&manager, Id::new(), manager.client_id, 4096);

        let mut tag = contract.stored_contract_hmac.to_vec();
        tag[0] ^= 0x01;
        let forged = Contract {
            stored_contract_hmac: Bytes::from(tag),
            ..contract
        };
        assert!(matches!(
            manager.verify_receive_contract(&forged),
            Err(TransferError::BadContract)
        ));
    }

    #[test]
    fn test_no_contract_policy() {
        let (manager, _) = manager();
        let peer = Id::new();

        assert!(manager.receive_no_contract(&CONTROL_ID));
        assert!(manager.send_no_contract(&manager.client_id, false));
        assert!(!manager.receive_no_contract(&peer));

        manager.add_receive_no_contract_peer(peer);
        assert!(manager.receive_no_contract(&peer));
    }

    /// A platform-shaped response for a contract toward `destination_id`.
    ///
    /// The issuing key belongs to the destination, so the sender-side
    /// queue stores the envelope without verifying it.
    fn platform_result(source_id: Id, destination_id: Id) -> (CreateContractResult, Id) {
        let stored = StoredContract {
            contract_id: Id::new(),
            transfer_byte_count: 4096,
            source_id,
            destination_id,
            stream_id: Id::NIL,
        };
        let contract = Contract {
            stored_contract_bytes: stored.encode(),
            stored_contract_hmac: Bytes::from(vec![0x5a; 32]),
            provide_mode: ProvideMode::Network,
        };
        (
            CreateContractResult {
                contract: Some(contract),
                error: None,
            },
            stored.contract_id,
        )
    }

    #[tokio::test]
    async fn test_queue_take_and_used_ids() {
        let (manager, sink) = manager();
        let key = ContractKey::to_destination(Id::new());
        manager.open_contract_queue(&key);

        // Zero timeout with nothing pending: immediate miss.
        assert!(manager.take_contract(&key, Duration::ZERO).await.is_none());

        let (result, contract_id) =
            platform_result(manager.client_id, key.destination.destination_id);
        assert!(manager.receive_create_contract_result(result));

        let (_, taken) = manager.take_contract(&key, Duration::ZERO).await.unwrap();
        assert_eq!(taken.contract_id, contract_id);

        // The used id rides the next create request.
        manager.create_contract(&key, 4096);
        let messages = sink.messages.lock();
        let create = messages
            .iter()
            .rev()
            .find_map(|message| match message {
                ControlMessage::CreateContract(create) => Some(create.clone()),
                _ => None,
            })
            .unwrap();
        assert!(create.used_contract_ids.contains(&contract_id));
    }

    #[tokio::test]
    async fn test_duplicate_contract_id_rejected_after_use() {
        let (manager, _) = manager();
        let key = ContractKey::to_destination(Id::new());
        manager.open_contract_queue(&key);

        let (result, _) = platform_result(manager.client_id, key.destination.destination_id);
        assert!(manager.receive_create_contract_result(result.clone()));
        manager.take_contract(&key, Duration::ZERO).await.unwrap();

        // Same id again: the used set is authoritative.
        assert!(!manager.receive_create_contract_result(result));

        // Flushing with reset clears the used record.
        manager.flush_contract_queue(&key, true);
        assert_eq!(manager.pending_contract_count(&key), 0);
    }

    #[test]
    fn test_provide_announcement() {
        let (manager, sink) = manager();
        manager.set_provide_modes(&[ProvideMode::Network]);

        let messages = sink.messages.lock();
        let provide = messages
            .iter()
            .find_map(|message| match message {
                ControlMessage::Provide(provide) => Some(provide.clone()),
                _ => None,
            })
            .unwrap();
        let modes: Vec<ProvideMode> = provide.keys.iter().map(|key| key.mode).collect();
        assert!(modes.contains(&ProvideMode::Network));
        assert!(modes.contains(&ProvideMode::Stream));
        for key in &provide.keys {
            assert_eq!(key.secret.len(), 32);
        }
    }
}
