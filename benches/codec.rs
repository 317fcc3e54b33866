use criterion::{black_box, criterion_group, criterion_main, Criterion};

use kecontact::protocol::{Command, StationCodec};

const STATE_REPORT: &[u8] = br#"{"ID": "2", "State": 3, "Error1": 0, "Error2": 0, "Plug": 7, "AuthON": 0, "Authreq": 0, "Enable sys": 1, "Enable user": 1, "Max curr": 16000, "Max curr %": 1000, "Curr HW": 32000, "Curr user": 16000, "Curr FS": 0, "Tmo FS": 0, "Curr timer": 0, "Tmo CT": 0, "Setenergy": 0, "Output": 0, "Input": 0, "X2 phaseSwitch source": 0, "X2 phaseSwitch": 0, "Serial": "15017355", "Sec": 4242}"#;

const METER_REPORT: &[u8] = br#"{"ID": "3", "U1": 230, "U2": 229, "U3": 231, "I1": 16000, "I2": 15980, "I3": 16020, "P": 11040000, "PF": 1000, "E pres": 52340, "E total": 987654321, "Serial": "15017355", "Sec": 4243}"#;

fn decode(c: &mut Criterion) {
    let codec = StationCodec::new();

    c.bench_function("decode state report", |b| {
        b.iter(|| codec.decode_payload(black_box(STATE_REPORT)))
    });
    c.bench_function("decode meter report", |b| {
        b.iter(|| codec.decode_payload(black_box(METER_REPORT)))
    });
    c.bench_function("decode ack", |b| {
        b.iter(|| codec.decode_payload(black_box(b"TCH-OK :done")))
    });
}

fn encode(c: &mut Criterion) {
    let codec = StationCodec::new();
    let display = Command::display("Charging at 11 kW", 1, 10).expect("valid display text");
    let currtime = Command::set_current_timed(16.0, 1).expect("valid current");

    c.bench_function("encode currtime", |b| {
        b.iter(|| codec.encode_command(black_box(&currtime)))
    });
    c.bench_function("encode display", |b| {
        b.iter(|| codec.encode_command(black_box(&display)))
    });
    c.bench_function("parse command", |b| {
        b.iter(|| black_box("failsafe 60 6000 0").parse::<Command>())
    });
}

criterion_group!(benches, decode, encode);
criterion_main!(benches);
