use super::*;
use arrayvec::ArrayVec;
use quickcheck_macros::quickcheck;
use std::vec::Vec;

/// A modifying operation on `BinaryHeap`.
#[derive(Debug)]
enum Cmd {
    Insert(u32),
    Remove(usize),
}

/// Map random bytes to operations on `BinaryHeap`.
fn interpret(bytecode: &[u8], max_len: usize) -> impl Iterator<Item = Cmd> + '_ {
    let mut i = 0;
    let mut len = 0;
    std::iter::from_fn(move || {
        let instr = bytecode.get(i..i + 5)?;
        i += 5;

        let value = u32::from_le_bytes([instr[1], instr[2], instr[3], instr[4]]);

        if (instr[0] % 2 == 0 && len != max_len) || len == 0 {
            len += 1;
            Some(Cmd::Insert(value))
        } else {
            len -= 1;
            Some(Cmd::Remove(value as usize % (len + 1)))
        }
    })
}

/// Elements remember where they are, like timers in a timer queue.
#[derive(Debug, Clone, Copy)]
struct El {
    value: u32,
    pos: usize,
}

struct Ctx;

impl BinaryHeapCtx<El> for Ctx {
    fn lt(&mut self, x: &El, y: &El) -> bool {
        x.value < y.value
    }

    fn on_move(&mut self, e: &mut El, new_index: usize) {
        e.pos = new_index;
    }
}

fn test_inner<T: BinaryHeap<Element = El> + Default + std::fmt::Debug>(
    bytecode: Vec<u8>,
    max_len: usize,
) {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut subject = T::default();
    let mut reference = Vec::new();

    log::debug!("max_len = {max_len}, bytecode len = {}", bytecode.len());

    for cmd in interpret(&bytecode, max_len) {
        log::trace!("    {cmd:?}");
        match cmd {
            Cmd::Insert(value) => {
                let i = subject.heap_push(El { value, pos: usize::MAX }, Ctx);
                log::trace!("     → {i}");
                assert_eq!(subject[i].value, value);

                let i = reference.binary_search(&value).unwrap_or_else(|x| x);
                reference.insert(i, value);
            }
            Cmd::Remove(i) => {
                let out = subject.heap_remove(i, Ctx).unwrap();
                log::trace!("     → {out:?}");

                let i_ref = reference.binary_search(&out.value).unwrap();
                reference.remove(i_ref);
            }
        }

        for (i, el) in subject.iter().enumerate() {
            assert_eq!(el.pos, i, "{subject:?}");
        }
        if let Some(first) = subject.first() {
            assert_eq!(first.value, reference[0]);
        }
    }

    let mut drained = Vec::new();
    while let Some(el) = subject.heap_pop(Ctx) {
        drained.push(el.value);
    }
    assert_eq!(drained, reference);
}

#[quickcheck]
fn test_arrayvec_4(bytecode: Vec<u8>) {
    test_inner::<ArrayVec<El, 4>>(bytecode, 4);
}

#[quickcheck]
fn test_arrayvec_10(bytecode: Vec<u8>) {
    test_inner::<ArrayVec<El, 10>>(bytecode, 10);
}

#[quickcheck]
fn test_vec(bytecode: Vec<u8>) {
    test_inner::<Vec<El>>(bytecode, usize::MAX);
}

#[test]
fn unit_ctx_orders_naturally() {
    let mut heap = Vec::new();
    for x in [5, 3, 9, 1, 7] {
        heap.heap_push(x, ());
    }
    let mut out = Vec::new();
    while let Some(x) = heap.heap_pop(()) {
        out.push(x);
    }
    assert_eq!(out, [1, 3, 5, 7, 9]);
    assert_eq!(heap.heap_remove(0, ()), None);
}
