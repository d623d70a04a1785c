//! Message contract between owner, follower and sub-endpoints.
//!
//! One enum covers requests and replies. Replies are matched by variant:
//! `Success`, `EmptyResultResponse` / `EmptyReadResponse` for "done, nothing
//! to return", and `Failure` carrying the remote [`ServiceError`].

use std::time::Duration;

use devgrid_endpoint::{EndpointRef, EndpointSystem};

use crate::error::ServiceError;
use crate::payload::*;
use crate::services::DeviceServices;
use crate::setup::DeviceSetup;

pub type DeviceEndpointRef = EndpointRef<Message>;
pub type DeviceEndpointSystem = EndpointSystem<Message>;

#[derive(Debug, Clone)]
pub enum Message {
    // ── Owner lifecycle ────────────────────────────────────────────
    /// Sent once by a new leader to its own endpoint.
    CreateInitialMasterActorData {
        services: DeviceServices,
        source_ids: Vec<SourceIdentifier>,
    },
    RefreshSetupMasterActorData {
        setup: DeviceSetup,
    },
    MasterActorDataInitialized,

    // ── Mount negotiation ──────────────────────────────────────────
    /// Follower → owner: please authorize a mount on `follower`.
    AskForMasterMountPoint {
        follower: DeviceEndpointRef,
    },
    /// Owner → follower endpoint, answering the original asker.
    RegisterMountPoint {
        source_ids: Vec<SourceIdentifier>,
        owner: DeviceEndpointRef,
    },
    UnregisterSlaveMountPoint,
    RefreshSlaveActor {
        setup: DeviceSetup,
        ask_timeout: Duration,
    },

    // ── Schema ─────────────────────────────────────────────────────
    YangTextSchemaSourceRequest {
        source_id: SourceIdentifier,
    },
    YangTextSchemaSource(YangTextSource),

    // ── Data broker ────────────────────────────────────────────────
    NewReadTransactionRequest,
    NewReadWriteTransactionRequest,
    NewWriteTransactionRequest,
    ReadRequest {
        store: Datastore,
        path: YangPath,
    },
    ExistsRequest {
        store: Datastore,
        path: YangPath,
    },
    PutRequest {
        store: Datastore,
        path: YangPath,
        data: DataNode,
    },
    MergeRequest {
        store: Datastore,
        path: YangPath,
        data: DataNode,
    },
    DeleteRequest {
        store: Datastore,
        path: YangPath,
    },
    SubmitRequest,
    CancelRequest,
    NormalizedNode(DataNode),
    EmptyReadResponse,
    Exists(bool),
    Cancelled(bool),

    // ── RPC and action ─────────────────────────────────────────────
    InvokeRpcMessage {
        rpc: QName,
        input: Option<DataNode>,
    },
    InvokeRpcMessageReply(RpcResult),
    InvokeActionMessage {
        action: SchemaPath,
        target: DataTreeIdentifier,
        input: DataNode,
    },
    InvokeActionMessageReply(ActionResult),
    EmptyResultResponse,

    // ── Bulk data tree ─────────────────────────────────────────────
    NetconfDataTreeServiceRequest,
    LockRequest,
    UnlockRequest,
    DiscardChangesRequest,
    GetRequest {
        path: YangPath,
        fields: Vec<YangPath>,
    },
    GetConfigRequest {
        path: YangPath,
        fields: Vec<YangPath>,
    },
    EditRequest {
        operation: EditOperation,
        store: Datastore,
        path: YangPath,
        data: Option<DataNode>,
    },
    CommitRequest,
    RpcResultReply(RpcResult),

    // ── Generic outcomes ───────────────────────────────────────────
    /// Done; optionally carries the sub-endpoint a request created.
    Success(Option<DeviceEndpointRef>),
    Failure(ServiceError),
}

impl Message {
    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::CreateInitialMasterActorData { .. } => "CreateInitialMasterActorData",
            Message::RefreshSetupMasterActorData { .. } => "RefreshSetupMasterActorData",
            Message::MasterActorDataInitialized => "MasterActorDataInitialized",
            Message::AskForMasterMountPoint { .. } => "AskForMasterMountPoint",
            Message::RegisterMountPoint { .. } => "RegisterMountPoint",
            Message::UnregisterSlaveMountPoint => "UnregisterSlaveMountPoint",
            Message::RefreshSlaveActor { .. } => "RefreshSlaveActor",
            Message::YangTextSchemaSourceRequest { .. } => "YangTextSchemaSourceRequest",
            Message::YangTextSchemaSource(_) => "YangTextSchemaSource",
            Message::NewReadTransactionRequest => "NewReadTransactionRequest",
            Message::NewReadWriteTransactionRequest => "NewReadWriteTransactionRequest",
            Message::NewWriteTransactionRequest => "NewWriteTransactionRequest",
            Message::ReadRequest { .. } => "ReadRequest",
            Message::ExistsRequest { .. } => "ExistsRequest",
            Message::PutRequest { .. } => "PutRequest",
            Message::MergeRequest { .. } => "MergeRequest",
            Message::DeleteRequest { .. } => "DeleteRequest",
            Message::SubmitRequest => "SubmitRequest",
            Message::CancelRequest => "CancelRequest",
            Message::NormalizedNode(_) => "NormalizedNode",
            Message::EmptyReadResponse => "EmptyReadResponse",
            Message::Exists(_) => "Exists",
            Message::Cancelled(_) => "Cancelled",
            Message::InvokeRpcMessage { .. } => "InvokeRpcMessage",
            Message::InvokeRpcMessageReply(_) => "InvokeRpcMessageReply",
            Message::InvokeActionMessage { .. } => "InvokeActionMessage",
            Message::InvokeActionMessageReply(_) => "InvokeActionMessageReply",
            Message::EmptyResultResponse => "EmptyResultResponse",
            Message::NetconfDataTreeServiceRequest => "NetconfDataTreeServiceRequest",
            Message::LockRequest => "LockRequest",
            Message::UnlockRequest => "UnlockRequest",
            Message::DiscardChangesRequest => "DiscardChangesRequest",
            Message::GetRequest { .. } => "GetRequest",
            Message::GetConfigRequest { .. } => "GetConfigRequest",
            Message::EditRequest { .. } => "EditRequest",
            Message::CommitRequest => "CommitRequest",
            Message::RpcResultReply(_) => "RpcResultReply",
            Message::Success(_) => "Success",
            Message::Failure(_) => "Failure",
        }
    }
}
