//! Error recovery, reconnection, reset, deletion and device unplug.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use common::*;
use nvmf_rdma::verbs::mock::ConnectScript;
use nvmf_rdma::verbs::{CmDisposition, CmEvent, WcStatus};
use nvmf_rdma::wire::{Completion, NVME_SC_ABORT_REQ, NVME_SC_SUCCESS};
use nvmf_rdma::{CtrlState, Outcome, TransportConfig};

#[test]
fn test_link_flap_aborts_inflight_and_reconnects() -> Result<()> {
    let mut opts = default_opts();
    // Room for 128 in-flight requests beyond the reserved tag.
    opts.queue_size = 129;
    let h = setup_with(opts, MockNvme::new(), TransportConfig::default());

    let entries: Vec<_> = (0..128)
        .map(|i| {
            let mut rq = read_rq(4096, one_seg(4096));
            rq.lba = i as u64 * 8;
            submit(&h.ctrl, 1, rq)
        })
        .collect();
    assert!(entries.iter().all(|e| e.is_started()));

    // Drop the link under them.
    let io_cm = h.provider.cm_ids()[1].clone();
    assert_eq!(io_cm.fire(CmEvent::Disconnected), CmDisposition::Keep);

    // Every in-flight request is cancelled with ABORT_REQ.
    assert!(wait_for(Duration::from_secs(5), || {
        entries.iter().all(|e| e.outcome().is_some())
    }));
    for entry in &entries {
        assert_eq!(
            entry.outcome(),
            Some(Outcome::Complete {
                status: NVME_SC_ABORT_REQ
            })
        );
    }

    // The reconnect worker rebuilds both queues and returns to Connected.
    assert!(wait_for(Duration::from_secs(5), || {
        h.ctrl.state() == CtrlState::Connected
    }));
    assert_eq!(h.provider.cm_ids().len(), 4);
    assert!(!h.ctrl.io_tag_set().unwrap().is_stopped());
    assert!(!h.ctrl.admin_tag_set().unwrap().is_stopped());

    // The rebuilt queue carries traffic again.
    let qp = h.provider.cm_ids()[3].qp().unwrap();
    let entry = submit(&h.ctrl, 1, read_rq(4096, one_seg(4096)));
    qp.complete_recv(&Completion::new(entry.tag(), NVME_SC_SUCCESS, 0), None);
    h.ctrl.queue(1).unwrap().process_completions();
    assert_eq!(entry.outcome(), Some(Outcome::Complete { status: 0 }));

    h.ctrl.delete().unwrap();
    Ok(())
}

#[test]
fn test_failed_recv_completion_triggers_recovery() -> Result<()> {
    let h = setup();
    let qp = qp_of(&h, 1);
    let queue = h.ctrl.queue(1).unwrap().clone();

    let entry = submit(&h.ctrl, 1, read_rq(4096, one_seg(4096)));
    qp.fail_recv(WcStatus::WrFlushErr);
    queue.process_completions();

    assert!(wait_for(Duration::from_secs(5), || {
        entry.outcome().is_some() && h.ctrl.state() == CtrlState::Connected
    }));
    assert_eq!(
        entry.outcome(),
        Some(Outcome::Complete {
            status: NVME_SC_ABORT_REQ
        })
    );

    h.ctrl.delete().unwrap();
    Ok(())
}

#[test]
fn test_unknown_tag_triggers_recovery_without_completion() -> Result<()> {
    let h = setup();
    let qp = qp_of(&h, 1);
    let queue = h.ctrl.queue(1).unwrap().clone();

    // A completion for a tag nothing started.
    qp.complete_recv(&Completion::new(7, NVME_SC_SUCCESS, 0), None);
    queue.process_completions();

    assert!(wait_for(Duration::from_secs(5), || {
        h.ctrl.state() == CtrlState::Connected && h.provider.cm_ids().len() == 4
    }));

    h.ctrl.delete().unwrap();
    Ok(())
}

#[test]
fn test_reconnect_cycles_leak_nothing() -> Result<()> {
    let h = setup();
    let baseline = h.provider.counts();
    assert_eq!(baseline.qps, 2);
    assert_eq!(baseline.cqs, 2);

    for cycle in 0..3 {
        let io_cm = h.provider.cm_ids().last().unwrap().clone();
        io_cm.fire(CmEvent::Disconnected);
        assert!(
            wait_for(Duration::from_secs(5), || {
                h.ctrl.state() == CtrlState::Connected
                    && h.provider.counts() == baseline
            }),
            "resources leaked on cycle {cycle}: {:?} vs {:?}",
            h.provider.counts(),
            baseline
        );
    }

    h.ctrl.delete().unwrap();
    let after = h.provider.counts();
    assert_eq!(after.qps, 0);
    assert_eq!(after.cqs, 0);
    assert_eq!(after.mrs, 0);
    assert_eq!(after.pds, 0);
    assert_eq!(after.dma_bufs, 0);
    Ok(())
}

#[test]
fn test_reset_rebuilds_controller() -> Result<()> {
    let h = setup();
    let cm_ids_before = h.provider.cm_ids().len();

    h.ctrl.reset().unwrap();

    assert_eq!(h.ctrl.state(), CtrlState::Connected);
    assert_eq!(h.provider.cm_ids().len(), cm_ids_before + 2);
    assert!(h.ops.admin_connects.load(Ordering::SeqCst) >= 2);
    assert!(h.ops.io_connects.load(Ordering::SeqCst) >= 2);

    // Still usable after the rebuild.
    let qp = h.provider.cm_ids().last().unwrap().qp().unwrap();
    let entry = submit(&h.ctrl, 1, read_rq(4096, one_seg(4096)));
    qp.complete_recv(&Completion::new(entry.tag(), NVME_SC_SUCCESS, 0), None);
    h.ctrl.queue(1).unwrap().process_completions();
    assert_eq!(entry.outcome(), Some(Outcome::Complete { status: 0 }));

    h.ctrl.delete().unwrap();
    Ok(())
}

#[test]
fn test_reset_failure_removes_dead_controller() -> Result<()> {
    let h = setup();

    // Starve the re-establishment: the admin queue cannot come back, so
    // the reset worker swaps over to dead-controller removal.
    h.provider.set_script(ConnectScript::Silent);
    h.ctrl.reset().unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        h.ctrl.state() == CtrlState::Deleting && h.transport.ctrl_count() == 0
    }));
    assert!(h.ops.removes.load(Ordering::SeqCst) >= 1);

    // Terminal: nothing revives a deleting controller.
    assert!(h.ctrl.reset().is_err());
    assert!(h.ctrl.delete().is_err());
    Ok(())
}

#[test]
fn test_delete_while_deleting_is_rejected() -> Result<()> {
    let h = setup();
    let io_queue = h.ctrl.queue(1).unwrap().clone();

    h.ctrl.delete().unwrap();
    assert!(h.ctrl.delete().is_err());
    assert!(h.ctrl.reset().is_err());

    // Freed queues accept no further work.
    assert!(!io_queue.is_connected());
    assert!(!io_queue.poll(1));
    let counts = h.provider.counts();
    assert_eq!(counts.qps, 0);
    Ok(())
}

#[test]
fn test_device_unplug_protocol() -> Result<()> {
    let h = setup();
    let io_cm = h.provider.cm_ids()[1].clone();
    let io_queue = h.ctrl.queue(1).unwrap().clone();
    assert!(io_queue.is_connected());

    // The handler must drive deletion to completion itself and then ask
    // the CM layer to destroy the id that delivered the event.
    assert_eq!(io_cm.fire(CmEvent::DeviceRemoval), CmDisposition::DestroyId);

    assert_eq!(h.ctrl.state(), CtrlState::Deleting);
    assert!(!io_queue.is_connected());
    assert_eq!(h.transport.ctrl_count(), 0);
    assert!(io_cm.disconnect_count() >= 1);
    assert!(h.ops.removes.load(Ordering::SeqCst) >= 1);

    // A second removal on the already-disabled queue is a no-op.
    assert_eq!(io_cm.fire(CmEvent::DeviceRemoval), CmDisposition::Keep);

    // Everything is gone.
    let counts = h.provider.counts();
    assert_eq!(counts.qps, 0);
    assert_eq!(counts.dma_bufs, 0);
    Ok(())
}

#[test]
fn test_unload_deletes_all_controllers() -> Result<()> {
    let provider = nvmf_rdma::verbs::mock::MockProvider::new();
    let transport = nvmf_rdma::RdmaTransport::new(provider.clone(), TransportConfig::default());
    let a = transport.create_ctrl(default_opts(), MockNvme::new()).unwrap();
    let b = transport.create_ctrl(default_opts(), MockNvme::new()).unwrap();
    assert_eq!(transport.ctrl_count(), 2);

    transport.unload();

    assert_eq!(transport.ctrl_count(), 0);
    assert_eq!(a.state(), CtrlState::Deleting);
    assert_eq!(b.state(), CtrlState::Deleting);
    let counts = provider.counts();
    assert_eq!(counts.qps, 0);
    assert_eq!(counts.dma_bufs, 0);
    Ok(())
}

#[test]
fn test_aen_rearm_and_rescan() -> Result<()> {
    let h = setup();
    let admin_qp = qp_of(&h, 0);
    let admin_queue = h.ctrl.queue(0).unwrap().clone();
    let aen_id = nvmf_rdma::config::AQ_BLKMQ_DEPTH as u16;

    let aen_sends = |qp: &nvmf_rdma::verbs::mock::MockQp| {
        qp.sent_flat()
            .iter()
            .filter(|wr| match wr {
                nvmf_rdma::verbs::SendWr::Send { wr_id, .. } => wr_id.index() == aen_id as u32,
                _ => false,
            })
            .count()
    };

    // The create path armed the first AEN.
    assert!(wait_for(Duration::from_secs(2), || aen_sends(&admin_qp) == 1));
    let scans_before = h.ops.scans.load(Ordering::SeqCst);

    // Namespace-changed notice: re-arm plus rescan.
    admin_qp.complete_recv(&Completion::new(aen_id, NVME_SC_SUCCESS, 0x0002), None);
    admin_queue.process_completions();

    assert!(wait_for(Duration::from_secs(2), || {
        aen_sends(&admin_qp) == 2 && h.ops.scans.load(Ordering::SeqCst) > scans_before
    }));

    // Aborted AEN: re-armed, but no rescan.
    let scans = h.ops.scans.load(Ordering::SeqCst);
    admin_qp.complete_recv(&Completion::new(aen_id, NVME_SC_ABORT_REQ, 0), None);
    admin_queue.process_completions();

    assert!(wait_for(Duration::from_secs(2), || aen_sends(&admin_qp) == 3));
    assert_eq!(h.ops.scans.load(Ordering::SeqCst), scans);

    h.ctrl.delete().unwrap();
    Ok(())
}
