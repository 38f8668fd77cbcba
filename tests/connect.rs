//! Queue and controller establishment, the connect capsule, and the
//! protocol sanity checks.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use nvmf_rdma::config::{AQ_BLKMQ_DEPTH, AQ_DEPTH};
use nvmf_rdma::fabrics::{self, OptMask};
use nvmf_rdma::verbs::mock::{ConnectScript, MockProvider};
use nvmf_rdma::verbs::{SendWr, WrKind};
use nvmf_rdma::wire::CmRequest;
use nvmf_rdma::{CtrlState, RdmaTransport, TransportConfig};

#[test]
fn test_create_reaches_connected() {
    let h = setup();
    assert_eq!(h.ctrl.state(), CtrlState::Connected);
    assert!(!h.ctrl.io_incapable());
    assert_eq!(h.transport.ctrl_count(), 1);

    // Admin queue plus one I/O queue, each with its own CM id.
    assert_eq!(h.provider.cm_ids().len(), 2);

    // Fabrics connects were issued for both levels.
    assert_eq!(h.ops.admin_connects.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(h.ops.io_connects.load(std::sync::atomic::Ordering::SeqCst), 1);

    h.ctrl.delete().unwrap();
    assert_eq!(h.transport.ctrl_count(), 0);
}

#[test]
fn test_receive_ring_fully_posted_on_establish() {
    let h = setup();

    // The ring must be posted by the time establishment completes: one
    // receive per queue-size slot, nothing consumed yet.
    let admin_qp = qp_of(&h, 0);
    assert_eq!(admin_qp.posted_recv_total(), AQ_DEPTH);
    assert_eq!(admin_qp.outstanding_recv_count(), AQ_DEPTH);

    let io_qp = qp_of(&h, 1);
    assert_eq!(io_qp.posted_recv_total(), h.ctrl.sqsize());

    h.ctrl.delete().unwrap();
}

#[test]
fn test_connect_capsule_contents() {
    let h = setup();

    let admin_param = h.provider.cm_ids()[0].connect_param().unwrap();
    let req = CmRequest::parse(&admin_param.private_data).unwrap();
    assert_eq!(req.qid(), 0);
    assert_eq!(req.hrqsize(), AQ_DEPTH as u16);
    assert_eq!(req.hsqsize(), AQ_DEPTH as u16);
    assert_eq!(admin_param.rnr_retry_count, 7);
    assert_eq!(admin_param.retry_count, 7);
    assert!(admin_param.flow_control);

    let io_param = h.provider.cm_ids()[1].connect_param().unwrap();
    let req = CmRequest::parse(&io_param.private_data).unwrap();
    assert_eq!(req.qid(), 1);
    assert_eq!(req.hrqsize(), h.ctrl.sqsize() as u16);
    assert_eq!(req.hsqsize(), h.ctrl.sqsize() as u16);

    h.ctrl.delete().unwrap();
}

#[test]
fn test_sqsize_clamped_by_mqes() {
    let ops = MockNvme::new();
    // MQES 7 (zero-based); the clamp keeps min(MQES + 1, sqsize).
    ops.cap.store(0x7, std::sync::atomic::Ordering::SeqCst);
    let h = setup_with(default_opts(), ops, TransportConfig::default());

    assert_eq!(h.ctrl.sqsize(), 8);
    let io_param = h.provider.cm_ids()[1].connect_param().unwrap();
    let req = CmRequest::parse(&io_param.private_data).unwrap();
    assert_eq!(req.hrqsize(), 8);

    h.ctrl.delete().unwrap();
}

#[test]
fn test_aen_armed_at_create() {
    let h = setup();

    // The async-event command occupies the slot beyond the admin tag
    // space and goes out unsignaled.
    let admin_qp = qp_of(&h, 0);
    assert!(wait_for(Duration::from_secs(2), || {
        admin_qp.sent_flat().iter().any(|wr| match wr {
            SendWr::Send { wr_id, signaled, .. } => {
                wr_id.kind() == WrKind::Send
                    && wr_id.index() == AQ_BLKMQ_DEPTH as u32
                    && !signaled
            }
            _ => false,
        })
    }));

    h.ctrl.delete().unwrap();
}

#[test]
fn test_icdoff_aborts_create() {
    let ops = MockNvme::new();
    ops.set_icdoff(16);
    let provider = MockProvider::new();
    let transport = RdmaTransport::new(provider.clone(), TransportConfig::default());

    assert!(transport.create_ctrl(default_opts(), ops).is_err());
    assert_eq!(transport.ctrl_count(), 0);
}

#[test]
fn test_missing_keyed_sgls_aborts_create() {
    let ops = MockNvme::new();
    ops.set_sgls(0);
    let provider = MockProvider::new();
    let transport = RdmaTransport::new(provider.clone(), TransportConfig::default());

    assert!(transport.create_ctrl(default_opts(), ops).is_err());
    assert_eq!(transport.ctrl_count(), 0);
}

#[test]
fn test_connect_rejected_with_status() {
    let provider = MockProvider::new();
    // recfmt 0, status 8, little-endian.
    provider.set_script(ConnectScript::Reject(Some(vec![0, 0, 8, 0])));
    let transport = RdmaTransport::new(provider.clone(), TransportConfig::default());

    let err = transport
        .create_ctrl(default_opts(), MockNvme::new())
        .unwrap_err();
    match err {
        nvmf_rdma::Error::Io(e) => {
            assert_eq!(e.raw_os_error(), Some(libc::ECONNRESET));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(transport.ctrl_count(), 0);
}

#[test]
fn test_connect_rejected_unparseable_private_data() {
    let provider = MockProvider::new();
    provider.set_script(ConnectScript::Reject(Some(vec![0, 0])));
    let transport = RdmaTransport::new(provider.clone(), TransportConfig::default());

    let err = transport
        .create_ctrl(default_opts(), MockNvme::new())
        .unwrap_err();
    match err {
        nvmf_rdma::Error::Io(e) => {
            assert_eq!(e.raw_os_error(), Some(libc::ECONNRESET));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_cm_gate_timeout() {
    let provider = MockProvider::new();
    provider.set_script(ConnectScript::Silent);
    let transport = RdmaTransport::new(provider.clone(), TransportConfig::default());

    let err = transport
        .create_ctrl(default_opts(), MockNvme::new())
        .unwrap_err();
    match err {
        nvmf_rdma::Error::Io(e) => {
            assert_eq!(e.raw_os_error(), Some(libc::ETIMEDOUT));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_addr_error_aborts_create() {
    let provider = MockProvider::new();
    provider.set_script(ConnectScript::AddrError);
    let transport = RdmaTransport::new(provider.clone(), TransportConfig::default());

    let err = transport
        .create_ctrl(default_opts(), MockNvme::new())
        .unwrap_err();
    match err {
        nvmf_rdma::Error::Io(e) => {
            assert_eq!(e.raw_os_error(), Some(libc::ECONNRESET));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // Nothing may leak out of the failed establishment.
    assert_eq!(provider.counts().qps, 0);
    assert_eq!(provider.counts().dma_bufs, 0);
}

#[test]
fn test_fabrics_registration() {
    let provider = MockProvider::new();
    let transport = RdmaTransport::register(provider, TransportConfig::default());
    assert!(fabrics::find_transport("rdma").is_some());

    // Required options must be provided.
    let err = fabrics::create_ctrl("rdma", &default_opts(), OptMask::ADDR, MockNvme::new());
    assert!(err.is_err());

    let ctrl = fabrics::create_ctrl(
        "rdma",
        &default_opts(),
        OptMask::ADDR | OptMask::PORT | OptMask::QUEUE_SIZE,
        MockNvme::new(),
    )
    .unwrap();
    assert_eq!(ctrl.state(), CtrlState::Connected);

    transport.unload();
    assert!(fabrics::find_transport("rdma").is_none());
    assert_eq!(transport.ctrl_count(), 0);
    let _ = Arc::strong_count(&ctrl);
}
