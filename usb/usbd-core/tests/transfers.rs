mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use driver_udc::sim::SimUDC;
use support::{vendor_device, TIMEOUT};
use usbd_core::{ClassDriver, CoreConfig, Error, Speed, UsbDevice};

#[test]
fn exact_multiple_ends_with_a_zero_length_packet() {
    let bench = vendor_device();
    bench.configure();
    let data = vec![0xA5u8; 128];

    bench.host.reset_stats();
    assert_eq!(bench.dev.write_bulk_sync(bench.ep_in, &data, true, TIMEOUT), Ok(128));
    assert_eq!(bench.host.transactions(bench.ep_in), 128 / 64 + 1);
    assert_eq!(bench.host.zlps(bench.ep_in), 1);

    bench.host.reset_stats();
    assert_eq!(bench.dev.write_bulk_sync(bench.ep_in, &data, false, TIMEOUT), Ok(128));
    assert_eq!(bench.host.transactions(bench.ep_in), 128 / 64);
    assert_eq!(bench.host.zlps(bench.ep_in), 0);

    let packets = bench.host.take_in(bench.ep_in);
    assert_eq!(packets.len(), 5);
    assert!(packets[2].is_empty());
}

#[test]
fn short_packet_ends_a_read() {
    let bench = vendor_device();
    bench.configure();

    bench.host.queue_out(bench.ep_out, &[7u8; 100], 64);
    let mut buf = [0u8; 256];
    assert_eq!(bench.dev.read_bulk_sync(bench.ep_out, &mut buf, TIMEOUT), Ok(100));
    assert!(buf[..100].iter().all(|&b| b == 7));

    // A zero-length packet ends a transfer on a packet boundary.
    bench.host.queue_out(bench.ep_out, &[1u8; 64], 64);
    bench.host.queue_out_packet(bench.ep_out, &[]);
    assert_eq!(bench.dev.read_bulk_sync(bench.ep_out, &mut buf, TIMEOUT), Ok(64));
}

#[test]
fn reads_time_out_without_data() {
    let bench = vendor_device();
    bench.configure();
    let mut buf = [0u8; 64];
    assert_eq!(
        bench.dev.read_bulk_sync(bench.ep_out, &mut buf, Some(Duration::from_millis(50))),
        Err(Error::Timeout)
    );
    // The endpoint is usable again afterwards.
    bench.host.queue_out(bench.ep_out, b"late", 64);
    assert_eq!(bench.dev.read_bulk_sync(bench.ep_out, &mut buf, TIMEOUT), Ok(4));
}

#[test]
fn transfers_need_the_right_endpoint() {
    let bench = vendor_device();
    let mut buf = [0u8; 8];
    assert_eq!(
        bench.dev.read_bulk_sync(bench.ep_out, &mut buf, TIMEOUT),
        Err(Error::InvalidState)
    );

    bench.configure();
    assert_eq!(
        bench.dev.read_bulk_sync(bench.ep_in, &mut buf, TIMEOUT),
        Err(Error::InvalidParameter("endpoint direction"))
    );
    assert_eq!(
        bench.dev.write_interrupt_sync(bench.ep_in, &buf, true, TIMEOUT),
        Err(Error::InvalidParameter("endpoint type"))
    );
    assert_eq!(
        bench.dev.read_bulk_async(bench.ep_out, 0, Box::new(|_| ())),
        Err(Error::InvalidParameter("length"))
    );
    // Endpoint of an inactive alternate setting.
    assert_eq!(
        bench.dev.write_bulk_sync(bench.alt_in, &buf, true, TIMEOUT),
        Err(Error::InvalidState)
    );
}

#[test]
fn aborting_completes_every_queued_urb_in_order() {
    let bench = vendor_device();
    bench.configure();
    let available = bench.dev.urbs_available();

    let seen = Arc::new(Mutex::new(Vec::new()));
    for tag in 0..3 {
        let seen = seen.clone();
        bench
            .dev
            .read_bulk_async(
                bench.ep_out,
                64,
                Box::new(move |completion| {
                    seen.lock().unwrap().push((tag, completion.result, completion.xfer_len));
                }),
            )
            .unwrap();
    }
    assert_eq!(bench.dev.urbs_available(), available - 3);

    bench.dev.abort_endpoint(bench.ep_out).unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        [
            (0, Err(Error::Aborted), 0),
            (1, Err(Error::Aborted), 0),
            (2, Err(Error::Aborted), 0)
        ]
    );
    assert_eq!(bench.dev.urbs_available(), available);

    // Aborting an idle endpoint is a no-op.
    assert_eq!(bench.dev.abort_endpoint(bench.ep_out), Ok(()));
}

#[test]
fn async_transfers_complete_through_the_event_loop() {
    let bench = vendor_device();
    bench.configure();

    let (tx, rx) = crossbeam_channel::bounded(4);
    let data: Vec<u8> = (0..150).map(|i| i as u8).collect();
    bench
        .dev
        .write_bulk_async(
            bench.ep_in,
            data.clone(),
            true,
            Box::new(move |completion| {
                let _ = tx.send(completion);
            }),
        )
        .unwrap();

    let completion = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(completion.result, Ok(()));
    assert_eq!(completion.xfer_len, 150);
    assert_eq!(completion.ep_addr, bench.ep_in);
    assert_eq!(bench.host.take_in(bench.ep_in).concat(), data);
}

#[test]
fn futures_wrap_async_transfers() {
    let bench = vendor_device();
    bench.configure();

    let read = bench.dev.bulk_read_future(bench.ep_out, 64).unwrap();
    bench.host.queue_out(bench.ep_out, b"ping", 64);
    assert_eq!(futures::executor::block_on(read), Ok(b"ping".to_vec()));

    let write = bench.dev.bulk_write_future(bench.ep_in, b"pong".to_vec(), true).unwrap();
    assert_eq!(futures::executor::block_on(write), Ok(4));
    assert_eq!(bench.host.take_in(bench.ep_in), [b"pong".to_vec()]);
}

#[test]
fn transport_errors_reach_the_caller() {
    let bench = vendor_device();
    bench.configure();

    bench.host.fail_next(bench.ep_in);
    assert_eq!(
        bench.dev.write_bulk_sync(bench.ep_in, b"x", true, TIMEOUT),
        Err(Error::Transmit)
    );
    assert_eq!(bench.dev.write_bulk_sync(bench.ep_in, b"x", true, TIMEOUT), Ok(1));
}

#[test]
fn stalled_endpoints_refuse_transfers() {
    let bench = vendor_device();
    bench.configure();

    bench.dev.stall_endpoint(bench.ep_in, true).unwrap();
    assert_eq!(bench.dev.is_endpoint_stalled(bench.ep_in), Ok(true));
    assert_eq!(
        bench.dev.write_bulk_sync(bench.ep_in, b"x", true, TIMEOUT),
        Err(Error::InvalidState)
    );
    bench.dev.stall_endpoint(bench.ep_in, false).unwrap();
    assert_eq!(bench.dev.write_bulk_sync(bench.ep_in, b"x", true, TIMEOUT), Ok(1));
}

#[test]
fn bus_reset_aborts_pending_transfers() {
    let bench = vendor_device();
    bench.configure();

    let (tx, rx) = crossbeam_channel::bounded(1);
    bench
        .dev
        .read_bulk_async(
            bench.ep_out,
            64,
            Box::new(move |completion| {
                let _ = tx.send(completion.result);
            }),
        )
        .unwrap();

    bench.host.reset();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Err(Error::Aborted));
    assert!(!bench.host.is_open(bench.ep_out));
    assert_eq!(bench.class.events(), ["enable 0", "disable 0"]);
}

struct Nop;
impl ClassDriver for Nop {}

fn build(dev: &UsbDevice) -> Vec<u8> {
    let cfg = dev.add_configuration(None, 0, 100, Speed::Full).unwrap();
    let mut addrs = Vec::new();
    for _ in 0..2 {
        let if_nbr = dev.add_interface(cfg, Arc::new(Nop), None, None, 0xFF, 0, 0, None).unwrap();
        addrs.push(dev.add_bulk_endpoint(cfg, if_nbr, 0, true, 64).unwrap());
        addrs.push(dev.add_interrupt_endpoint(cfg, if_nbr, 0, false, 16, 4).unwrap());
        let alt = dev.add_alt_interface(cfg, if_nbr, None, None).unwrap();
        addrs.push(dev.add_bulk_endpoint(cfg, if_nbr, alt, true, 32).unwrap());
    }
    addrs
}

#[test]
fn allocation_is_deterministic_and_disjoint() {
    let first = {
        let (udc, _host) = SimUDC::full_speed();
        build(&UsbDevice::new(Box::new(udc), CoreConfig::default()).unwrap())
    };
    let second = {
        let (udc, _host) = SimUDC::full_speed();
        build(&UsbDevice::new(Box::new(udc), CoreConfig::default()).unwrap())
    };
    assert_eq!(first, second);
    assert_eq!(first, [0x81, 0x01, 0x82, 0x83, 0x02, 0x84]);

    let mut sorted = first.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), first.len());
}
