use crate::{
    codegen::arch::{Target, TargetInterface},
    signature::ParamClass,
};

/// How the hidden callable pointer is injected in front of the caller's arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Every integer argument still fits in a register after the shift, so the trampoline only
    /// moves registers and tail-jumps to the dispatcher.
    Registers {
        /// Number of integer registers moved one position down the argument order.
        shifted: usize,
    },
    /// The last integer argument register is displaced onto the stack, so the caller's stack
    /// arguments are relocated and the dispatcher is called as a subroutine.
    Relocate {
        /// Stack words the caller pushed for the native signature.
        stack_words: usize,
        /// Number of those words that precede the displaced argument in the new stack layout.
        displaced_slot: usize,
    },
}

/// Register and stack usage of a signature under the target calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Parameters passed in general purpose registers or as integer stack words.
    pub int_params: usize,
    /// Parameters passed in vector registers or as floating point stack words.
    pub float_params: usize,
    /// Parameters the caller placed on the stack.
    pub stack_words: usize,
    /// Stack parameters that precede the integer parameter pushed out of the last register.
    pub displaced_slot: usize,
}

impl Layout {
    /// Classify `params`, given in declaration order.
    pub fn classify(params: &[ParamClass]) -> Self {
        let int_regs = Target::INTEGER_ARG_REGISTERS;
        let float_regs = Target::FLOAT_ARG_REGISTERS;

        let mut int_params = 0;
        let mut float_params = 0;
        let mut displaced_seen = false;
        let mut displaced_slot = 0;

        for class in params {
            match class {
                ParamClass::Integer => {
                    if int_params == int_regs - 1 {
                        displaced_seen = true;
                    }
                    int_params += 1;
                }
                ParamClass::Float => {
                    // Integer stack words always follow the displaced register, only floats
                    // spilled ahead of it stay in front.
                    if float_params >= float_regs && !displaced_seen {
                        displaced_slot += 1;
                    }
                    float_params += 1;
                }
            }
        }

        let stack_words =
            int_params.saturating_sub(int_regs) + float_params.saturating_sub(float_regs);
        if !displaced_seen {
            displaced_slot = 0;
        }

        Self {
            int_params,
            float_params,
            stack_words,
            displaced_slot,
        }
    }

    /// The injection strategy this layout requires.
    pub fn strategy(&self) -> Strategy {
        if self.int_params < Target::INTEGER_ARG_REGISTERS {
            Strategy::Registers {
                shifted: self.int_params,
            }
        } else {
            Strategy::Relocate {
                stack_words: self.stack_words,
                displaced_slot: self.displaced_slot,
            }
        }
    }
}
