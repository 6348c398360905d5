//! Pipe primitive contracts: EOF stickiness, prefix delivery, poisoning.

use pipenet::pipe::pipe;
use pipenet::NetError;

#[test]
fn test_eof_semantics_end_to_end() {
    // Capacity 2: write a, b, EOF; read a, b, then sticky None.
    let (rx, tx) = pipe(2);
    tx.try_write(Some('a')).unwrap();
    tx.try_write(Some('b')).unwrap();
    tx.try_write(None).unwrap();

    assert_eq!(rx.try_read().unwrap(), Some('a'));
    assert_eq!(rx.try_read().unwrap(), Some('b'));
    assert_eq!(rx.try_read().unwrap(), None);
    assert_eq!(rx.try_read().unwrap(), None);

    let err = tx.try_write(Some('c')).unwrap_err();
    assert_eq!(err.error, NetError::BrokenPipe);
}

#[tokio::test]
async fn test_reader_observes_exact_write_prefix() {
    // Cross-thread: a producer thread feeds a bounded pipe that a tokio
    // reader drains; the delivered sequence must equal the written one.
    let (rx, tx) = pipe::<u32>(4);

    let producer = std::thread::spawn(move || {
        for i in 0..1000u32 {
            loop {
                match tx.try_write(Some(i)) {
                    Ok(()) => break,
                    Err(e) if e.error == NetError::WouldBlock => std::thread::yield_now(),
                    Err(e) => panic!("unexpected write error: {:?}", e.error),
                }
            }
        }
        tx.try_write(None).unwrap();
    });

    let mut delivered = Vec::new();
    while let Some(v) = rx.read().await.unwrap() {
        delivered.push(v);
    }
    producer.join().unwrap();

    assert_eq!(delivered, (0..1000).collect::<Vec<u32>>());
    assert!(rx.is_eof());
}

#[tokio::test]
async fn test_set_error_poisons_both_ends() {
    let (rx, tx) = pipe(8);
    tx.write(Some(1)).await.unwrap();
    tx.set_error(NetError::ConnectionReset);

    // Buffered data is not delivered past the error.
    assert_eq!(rx.read().await.unwrap_err(), NetError::ConnectionReset);
    assert_eq!(tx.write(Some(2)).await.unwrap_err(), NetError::ConnectionReset);
    assert_eq!(rx.try_read().unwrap_err(), NetError::ConnectionReset);
}

#[tokio::test]
async fn test_close_is_terminal_for_both_ends() {
    let (rx, tx) = pipe(2);
    tx.try_write(Some(9)).unwrap();
    tx.close();

    assert_eq!(rx.try_read().unwrap_err(), NetError::Closed);
    assert_eq!(tx.try_write(Some(10)).unwrap_err().error, NetError::Closed);
}

#[tokio::test]
async fn test_write_handle_signals_space() {
    let (rx, tx) = pipe(1);
    tx.try_write(Some(1)).unwrap();

    let wh = tx.handle();
    assert!(!wh.is_ready());

    let waiter = tokio::spawn(async move {
        wh.ready().await;
    });
    tokio::task::yield_now().await;
    assert_eq!(rx.try_read().unwrap(), Some(1));
    waiter.await.unwrap();
}

#[tokio::test]
async fn test_read_handle_ready_on_eof() {
    let (rx, tx) = pipe::<u8>(2);
    let rh = rx.handle();
    assert!(!rh.is_ready());
    tx.try_write(None).unwrap();
    assert!(rh.is_ready());
    rh.ready().await;
    assert_eq!(rx.try_read().unwrap(), None);
}

#[test]
fn test_writer_clone_keeps_stream_open() {
    let (rx, tx) = pipe::<u8>(4);
    let tx2 = tx.clone();
    tx.try_write(Some(1)).unwrap();
    drop(tx);
    // A sibling writer still holds the stream open.
    assert!(!rx.is_eof());
    tx2.try_write(Some(2)).unwrap();
    drop(tx2);
    assert!(rx.is_eof());
    assert_eq!(rx.try_read().unwrap(), Some(1));
    assert_eq!(rx.try_read().unwrap(), Some(2));
    assert_eq!(rx.try_read().unwrap(), None);
}
