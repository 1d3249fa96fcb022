use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use gearwire::config::ServerConfig;
use gearwire::logging::Logger;
use gearwire::protocol::codec::{encode_response, HEADER_SIZE_BYTES};
use gearwire::protocol::{PacketCodec, ResponseCommand};
use gearwire::transport::{ReadOutcome, TcpTransport};
use gearwire::{Connection, Task, TaskHandle, TaskState};

fn response(command: ResponseCommand, body: &[u8]) -> Vec<u8> {
    encode_response(command, body).expect("response should encode")
}

fn read_request(stream: &mut TcpStream) -> (u32, Vec<u8>) {
    let mut header = [0_u8; HEADER_SIZE_BYTES];
    stream.read_exact(&mut header).expect("request header");
    assert_eq!(&header[0..4], b"\0REQ");
    let code = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let mut body = vec![0_u8; len];
    stream.read_exact(&mut body).expect("request body");
    (code, body)
}

/// Reverses every submitted payload, reporting progress first.
fn spawn_reverse_server(jobs: usize) -> (u16, thread::JoinHandle<Vec<u32>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
    let port = listener.local_addr().expect("local addr").port();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept should succeed");
        let mut codes = Vec::new();
        for index in 0..jobs {
            let (code, body) = read_request(&mut stream);
            codes.push(code);
            let payload = body.splitn(3, |byte| *byte == 0).nth(2).unwrap_or_default();
            let handle = format!("H:loop:{index}");

            stream
                .write_all(&response(ResponseCommand::JobCreated, handle.as_bytes()))
                .expect("job_created");

            let mut status = handle.clone().into_bytes();
            status.extend_from_slice(b"\x001\x001");
            let mut complete = handle.into_bytes();
            complete.push(0);
            complete.extend(payload.iter().rev());

            let mut reply = response(ResponseCommand::WorkStatus, &status);
            reply.extend(response(ResponseCommand::WorkComplete, &complete));
            stream.write_all(&reply).expect("work events");
        }
        codes
    });

    (port, server)
}

fn drive_until_idle(connection: &mut Connection<TcpTransport>) {
    let mut buffer = [0_u8; 7];
    for _ in 0..1_000 {
        if connection.is_idle() {
            return;
        }
        match connection
            .transport_mut()
            .try_read(&mut buffer)
            .expect("read should not fail")
        {
            ReadOutcome::Data(size) => connection
                .on_bytes(&buffer[..size])
                .expect("server speaks valid protocol"),
            ReadOutcome::WouldBlock => {
                connection
                    .transport_mut()
                    .flush_pending()
                    .expect("flush should not fail");
                thread::sleep(Duration::from_millis(2));
            }
            ReadOutcome::Closed => panic!("server closed early"),
        }
    }
    panic!("connection did not go idle");
}

#[test]
fn submits_sequentially_and_collects_results_over_tcp() {
    let (port, server) = spawn_reverse_server(3);
    let transport = TcpTransport::connect(&ServerConfig {
        host: "127.0.0.1".to_owned(),
        port,
        connect_timeout_ms: 1_000,
    })
    .expect("transport should connect");
    let mut connection = Connection::new(transport, PacketCodec::default(), Logger::discard());

    let results = Arc::new(Mutex::new(Vec::new()));
    let statuses = Arc::new(Mutex::new(0_usize));
    let tasks: Vec<TaskHandle> = ["hello", "gearman", "abc"]
        .into_iter()
        .map(|payload| {
            let results = Arc::clone(&results);
            let statuses = Arc::clone(&statuses);
            TaskHandle::new(
                Task::new("reverse", payload)
                    .on_complete(move |reversed| {
                        results
                            .lock()
                            .expect("results lock poisoned")
                            .push(String::from_utf8_lossy(reversed).into_owned());
                    })
                    .on_status(move |_, _| {
                        *statuses.lock().expect("status lock poisoned") += 1;
                    }),
            )
        })
        .collect();

    for task in &tasks {
        connection.queue(task).expect("queue before open");
    }
    connection.on_open().expect("open should flush deferred submission");
    drive_until_idle(&mut connection);

    assert_eq!(
        *results.lock().expect("results lock poisoned"),
        vec!["olleh", "namraeg", "cba"]
    );
    assert_eq!(*statuses.lock().expect("status lock poisoned"), 3);
    assert!(tasks.iter().all(|task| task.state() == TaskState::Completed));
    assert_eq!(connection.take_finished().len(), 3);
    assert_eq!(server.join().expect("server thread"), vec![7, 7, 7]);
}
