//! Packet Pipeline Benchmarks

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tessera_stack::{NetworkStack, Packet, StackVirtual};
use tracing_subscriber::EnvFilter;

const ETHERTYPE_IP: u16 = 0x0800;
const VXLAN_PORT: u16 = 4789;

fn ethernet(payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 12];
    frame.extend_from_slice(&ETHERTYPE_IP.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn ipv4(src: [u8; 4], dst: [u8; 4], protocol: u8, payload: &[u8]) -> Vec<u8> {
    let total = (20 + payload.len()) as u16;
    let mut ip = vec![0x45, 0x00];
    ip.extend_from_slice(&total.to_be_bytes());
    ip.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 64, protocol, 0x00, 0x00]);
    ip.extend_from_slice(&src);
    ip.extend_from_slice(&dst);
    ip.extend_from_slice(payload);
    ip
}

fn udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut dgram = Vec::with_capacity(8 + payload.len());
    dgram.extend_from_slice(&src_port.to_be_bytes());
    dgram.extend_from_slice(&dst_port.to_be_bytes());
    dgram.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    dgram.extend_from_slice(&[0, 0]);
    dgram.extend_from_slice(payload);
    dgram
}

fn tcp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut seg = Vec::with_capacity(20 + payload.len());
    seg.extend_from_slice(&src_port.to_be_bytes());
    seg.extend_from_slice(&dst_port.to_be_bytes());
    seg.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0x18, 0xff, 0xff, 0, 0, 0, 0]);
    seg.extend_from_slice(payload);
    seg
}

/// VXLAN frame carrying an inner HTTP request from host `i`
fn overlay_frame(i: u16) -> Bytes {
    let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let host = [10, 0, (i >> 8) as u8, i as u8];
    let inner = ethernet(&ipv4(host, [10, 1, 0, 1], 6, &tcp(30000 + i, 80, request)));

    let mut vxlan = vec![0x08, 0, 0, 0, 0, 0, 7, 0];
    vxlan.extend_from_slice(&inner);
    let outer = ipv4([192, 168, 0, 1], [192, 168, 0, 2], 17, &udp(40000, VXLAN_PORT, &vxlan));
    Bytes::from(ethernet(&outer))
}

fn stack(total: usize) -> StackVirtual {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .try_init();
    let stack = StackVirtual::new().expect("stack assembly");
    stack.set_total_tcp_flows(total);
    stack.set_total_udp_flows(total);
    stack
}

fn bench_single_overlay_flow(c: &mut Criterion) {
    let stack = stack(1024);
    let frame = overlay_frame(1);
    let mut ts = 0u64;

    c.bench_function("vxlan_http_same_flow", |b| {
        b.iter(|| {
            ts += 1;
            let mut packet = Packet::new(frame.clone(), ts / 1000);
            black_box(stack.process_packet(&mut packet))
        })
    });
}

fn bench_pipeline_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_throughput");
    let frames: Vec<Bytes> = (0..64).map(overlay_frame).collect();
    let bytes: usize = frames.iter().map(|f| f.len()).sum();
    group.throughput(Throughput::Bytes(bytes as u64));

    for mode in ["classify", "frequency"] {
        let stack = stack(4096);
        stack.enable_frequency_engine(mode == "frequency");
        group.bench_function(format!("64_overlay_flows_{mode}"), |b| {
            b.iter(|| {
                let mut accepted = 0u32;
                for frame in &frames {
                    let mut packet = Packet::new(frame.clone(), 1);
                    accepted += stack.process_packet(&mut packet) as u32;
                }
                black_box(accepted)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single_overlay_flow, bench_pipeline_throughput);

criterion_main!(benches);
