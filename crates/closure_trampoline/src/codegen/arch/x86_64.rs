//! System V AMD64 encodings.
//!
//! Scratch registers: `rax` holds the dispatcher address and the copy cursor, `r10` the displaced
//! sixth integer argument, `r11` the caller's return address. `rdi` is free as a temporary once
//! its value has been shifted into `rsi`.

use super::TargetInterface;

use arrayvec::ArrayVec;
use dynasmrt::{
    dynasm,
    x64::{Rq, X64Relocation},
    DynamicLabel, DynasmApi, DynasmLabelApi,
};

pub struct Target {}

impl TargetInterface for Target {
    type Relocation = X64Relocation;

    const INTEGER_ARG_REGISTERS: usize = ARG_REGISTERS.len();
    const FLOAT_ARG_REGISTERS: usize = 8;
    const WORD_SIZE: usize = 8;
    const STACK_RELOCATION_LABELS: usize = 4;

    fn emit_register_injection<A: DynasmApi>(
        ops: &mut A,
        shifted: usize,
        callable: *const (),
        dispatch: *const u8,
    ) {
        debug_assert!(shifted < Self::INTEGER_ARG_REGISTERS);

        emit_shifts(ops, shifted);
        dynasm!(ops
            ; mov rdi, QWORD callable as i64
            ; mov rax, QWORD dispatch as i64
            ; jmp rax
        );
    }

    fn emit_stack_relocation<A: DynasmLabelApi<Relocation = Self::Relocation>>(
        ops: &mut A,
        stack_words: usize,
        displaced_slot: usize,
        callable: *const (),
        dispatch: *const u8,
        labels: &[DynamicLabel],
    ) {
        debug_assert!(displaced_slot <= stack_words);
        let (head_labels, tail_labels) = labels.split_at(2);

        // Offsets below are relative to rsp after `push r9`, where the caller's return address
        // sits at `word` and stack argument `i` at `(i + 2) * word`.
        let word = Self::WORD_SIZE as i32;
        let stack_words = stack_words as i32;
        let displaced_slot = displaced_slot as i32;
        let ret_slot = (stack_words + 1) * word;

        dynasm!(ops
            ; mov r11, [rsp]
            ; push r9
        );
        if displaced_slot > 0 {
            dynasm!(ops; mov r10, r9);
        }

        emit_shifts(ops, Self::INTEGER_ARG_REGISTERS - 1);

        // Words ahead of the displaced argument close the gap left by the return address and
        // the pushed register, the rest only the return address.
        if displaced_slot > 0 {
            let displaced = displaced_slot * word;
            emit_copy_down(ops, head_labels, 0, displaced, 2 * word);
            dynasm!(ops; mov [rsp + displaced], r10);
        }
        if displaced_slot < stack_words {
            emit_copy_down(ops, tail_labels, (displaced_slot + 1) * word, ret_slot, word);
        }

        dynasm!(ops
            ; mov [rsp + ret_slot], r11
            ; mov rdi, QWORD callable as i64
            ; mov rax, QWORD dispatch as i64
            ; call rax
            ; mov r11, [rsp + ret_slot]
            ; add rsp, word
            ; mov [rsp], r11
            ; ret
        );
    }
}

const ARG_REGISTERS: [u8; 6] = [
    Rq::RDI as u8,
    Rq::RSI as u8,
    Rq::RDX as u8,
    Rq::RCX as u8,
    Rq::R8 as u8,
    Rq::R9 as u8,
];

/// `(dst, src)` moves shifting the first `count` integer arguments one register down, highest
/// register first so no value is overwritten before it is copied.
fn register_shifts(count: usize) -> ArrayVec<(u8, u8), 5> {
    (0..count)
        .rev()
        .map(|i| (ARG_REGISTERS[i + 1], ARG_REGISTERS[i]))
        .collect()
}

fn emit_shifts<A: DynasmApi>(ops: &mut A, count: usize) {
    for (dst, src) in register_shifts(count) {
        dynasm!(ops; mov Rq(dst), Rq(src));
    }
}

/// Copy the stack words at `[rsp + from + distance, rsp + to + distance)` to
/// `[rsp + from, rsp + to)`, lowest address first. `labels` holds the loop head and exit.
fn emit_copy_down<A: DynasmLabelApi<Relocation = X64Relocation>>(
    ops: &mut A,
    labels: &[DynamicLabel],
    from: i32,
    to: i32,
    distance: i32,
) {
    let word = Target::WORD_SIZE as i32;
    let (top, done) = (labels[0], labels[1]);

    dynasm!(ops
        ; lea rax, [rsp + from]
        ; =>top
        ; lea rdi, [rsp + to]
        ; cmp rax, rdi
        ; je =>done
        ; mov rdi, [rax + distance]
        ; mov [rax], rdi
        ; add rax, word
        ; jmp =>top
        ; =>done
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    use dynasmrt::VecAssembler;

    const CALLABLE: *const () = 0x1122_3344_5566_7788 as *const ();
    const DISPATCH: *const u8 = 0x0102_0304_0506_0708 as *const u8;

    fn assemble(f: impl FnOnce(&mut VecAssembler<X64Relocation>)) -> Vec<u8> {
        let mut ops = VecAssembler::new(0);
        f(&mut ops);
        ops.finalize().unwrap()
    }

    fn injection(shifted: usize) -> Vec<u8> {
        assemble(|ops| Target::emit_register_injection(ops, shifted, CALLABLE, DISPATCH))
    }

    fn relocation(stack_words: usize, displaced_slot: usize) -> Vec<u8> {
        assemble(|ops| {
            let labels: Vec<_> = (0..Target::STACK_RELOCATION_LABELS)
                .map(|_| ops.new_dynamic_label())
                .collect();
            Target::emit_stack_relocation(
                ops,
                stack_words,
                displaced_slot,
                CALLABLE,
                DISPATCH,
                &labels,
            )
        })
    }

    /// Reference copy loop, spelled out independently of `emit_copy_down`.
    fn reference_copy(ops: &mut VecAssembler<X64Relocation>, from: i32, to: i32, distance: i32) {
        let word = 8i32;
        let top = ops.new_dynamic_label();
        let done = ops.new_dynamic_label();
        dynasm!(ops
            ; lea rax, [rsp + from]
            ; =>top
            ; lea rdi, [rsp + to]
            ; cmp rax, rdi
            ; je =>done
            ; mov rdi, [rax + distance]
            ; mov [rax], rdi
            ; add rax, word
            ; jmp =>top
            ; =>done
        );
    }

    fn reference_call_and_return(ops: &mut VecAssembler<X64Relocation>, ret_slot: i32) {
        let word = 8i32;
        dynasm!(ops
            ; mov [rsp + ret_slot], r11
            ; mov rdi, QWORD CALLABLE as i64
            ; mov rax, QWORD DISPATCH as i64
            ; call rax
            ; mov r11, [rsp + ret_slot]
            ; add rsp, word
            ; mov [rsp], r11
            ; ret
        );
    }

    #[test]
    fn shift_order() {
        let regs = |v: ArrayVec<(u8, u8), 5>| v.into_iter().collect::<Vec<_>>();

        assert!(register_shifts(0).is_empty());
        assert_eq!(
            regs(register_shifts(3)),
            [
                (Rq::RCX as u8, Rq::RDX as u8),
                (Rq::RDX as u8, Rq::RSI as u8),
                (Rq::RSI as u8, Rq::RDI as u8),
            ]
        );
        assert_eq!(register_shifts(5)[0], (Rq::R9 as u8, Rq::R8 as u8));
    }

    #[test]
    fn injection_encoding() {
        let mut expected = vec![0x48, 0xBF]; // mov rdi, imm64
        expected.extend_from_slice(&(CALLABLE as u64).to_le_bytes());
        expected.extend_from_slice(&[0x48, 0xB8]); // mov rax, imm64
        expected.extend_from_slice(&(DISPATCH as u64).to_le_bytes());
        expected.extend_from_slice(&[0xFF, 0xE0]); // jmp rax

        assert_eq!(injection(0), expected);
    }

    #[test]
    fn injection_shifts_used_registers() {
        let expected = assemble(|ops| {
            dynasm!(ops
                ; mov r8, rcx
                ; mov rcx, rdx
                ; mov rdx, rsi
                ; mov rsi, rdi
                ; mov rdi, QWORD CALLABLE as i64
                ; mov rax, QWORD DISPATCH as i64
                ; jmp rax
            )
        });

        assert_eq!(injection(4), expected);
        // Each register move is a three byte REX.W mov.
        assert_eq!(injection(4).len(), injection(0).len() + 4 * 3);
    }

    #[test]
    fn relocation_without_stack_arguments() {
        let expected = assemble(|ops| {
            dynasm!(ops
                ; mov r11, [rsp]
                ; push r9
                ; mov r9, r8
                ; mov r8, rcx
                ; mov rcx, rdx
                ; mov rdx, rsi
                ; mov rsi, rdi
            );
            reference_call_and_return(ops, 8);
        });

        assert_eq!(relocation(0, 0), expected);
    }

    #[test]
    fn relocation_of_trailing_words() {
        let expected = assemble(|ops| {
            dynasm!(ops
                ; mov r11, [rsp]
                ; push r9
                ; mov r9, r8
                ; mov r8, rcx
                ; mov rcx, rdx
                ; mov rdx, rsi
                ; mov rsi, rdi
            );
            reference_copy(ops, 8, 32, 8);
            reference_call_and_return(ops, 32);
        });

        assert_eq!(relocation(3, 0), expected);
    }

    #[test]
    fn relocation_around_displaced_word() {
        let expected = assemble(|ops| {
            let displaced = 16i32;
            dynasm!(ops
                ; mov r11, [rsp]
                ; push r9
                ; mov r10, r9
                ; mov r9, r8
                ; mov r8, rcx
                ; mov rcx, rdx
                ; mov rdx, rsi
                ; mov rsi, rdi
            );
            reference_copy(ops, 0, 16, 16);
            dynasm!(ops; mov [rsp + displaced], r10);
            reference_copy(ops, 24, 40, 8);
            reference_call_and_return(ops, 40);
        });

        assert_eq!(relocation(4, 2), expected);
    }

    #[test]
    fn relocation_with_only_leading_words() {
        let expected = assemble(|ops| {
            let displaced = 8i32;
            dynasm!(ops
                ; mov r11, [rsp]
                ; push r9
                ; mov r10, r9
                ; mov r9, r8
                ; mov r8, rcx
                ; mov rcx, rdx
                ; mov rdx, rsi
                ; mov rsi, rdi
            );
            reference_copy(ops, 0, 8, 16);
            dynasm!(ops; mov [rsp + displaced], r10);
            reference_call_and_return(ops, 16);
        });

        assert_eq!(relocation(1, 1), expected);
    }

    #[test]
    fn code_size_is_bounded() {
        let capacity = PoolConfig::DEFAULT_SLOT_SIZE;

        for shifted in 0..Target::INTEGER_ARG_REGISTERS {
            assert!(injection(shifted).len() <= capacity);
        }

        let mut lengths = vec![];
        for stack_words in 0..24 {
            for displaced_slot in 0..=stack_words {
                let len = relocation(stack_words, displaced_slot).len();
                assert!(len <= capacity, "{stack_words}/{displaced_slot}: {len} bytes");
                lengths.push(len);
            }
        }

        // Arity does not change the instruction count, only the immediates.
        let with_both_loops = relocation(5, 2).len();
        assert_eq!(relocation(20, 7).len(), with_both_loops);
        assert_eq!(lengths.iter().max(), Some(&with_both_loops));
    }
}
