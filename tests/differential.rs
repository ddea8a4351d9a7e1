//! Differential property: for the same body, the interpreter and the
//! compiled tier must produce identical results. Bodies are generated
//! pseudo-randomly from fixed seeds; every generated function exists twice
//! in the image, once HOT and once cold, and the pair must agree on every
//! input.

mod common;

use common::{Asm, ImageBuilder};
use espb::isa::Opcode;
use espb::{Config, Instance, Module, SymbolRegistry, Value, ValueType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const NUM_BODIES: usize = 12;
const OPS_PER_BODY: usize = 24;
const NUM_REGS: u8 = 8;

/// Operators that cannot trap on same-tag integer operands.
const SAFE_OPS: [Opcode; 8] = [
    Opcode::Add,
    Opcode::Sub,
    Opcode::Mul,
    Opcode::And,
    Opcode::Or,
    Opcode::Xor,
    Opcode::Shl,
    Opcode::Shr,
];

fn random_body(rng: &mut StdRng) -> Vec<u8> {
    let mut asm = Asm::new();
    // Registers beyond the two arguments start as I32 zero; seed a few
    // with constants so the dataflow is not all zeros.
    for rd in 2..NUM_REGS {
        asm.ldc_i32(rd, rng.gen());
    }
    for _ in 0..OPS_PER_BODY {
        let op = SAFE_OPS[rng.gen_range(0..SAFE_OPS.len())];
        let rd = rng.gen_range(2..NUM_REGS);
        let ra = rng.gen_range(0..NUM_REGS);
        let rb = rng.gen_range(0..NUM_REGS);
        asm.binop(op, rd, ra, rb);
    }
    let ret = rng.gen_range(2..NUM_REGS);
    asm.ret(ret).finish()
}

#[test]
fn interpreter_and_compiled_tier_agree() {
    let mut rng = StdRng::seed_from_u64(0xE5B);

    let mut b = ImageBuilder::new();
    let sig = b.signature(&[ValueType::I32, ValueType::I32], &[ValueType::I32]);
    let mut pairs = Vec::new();
    for _ in 0..NUM_BODIES {
        let code = random_body(&mut rng);
        let hot = b.func(sig, NUM_REGS as u16, true, code.clone());
        let cold = b.func(sig, NUM_REGS as u16, false, code);
        pairs.push((hot, cold));
    }
    for (i, (hot, cold)) in pairs.iter().enumerate() {
        b.export_func(Box::leak(format!("hot_{}", i).into_boxed_str()), *hot);
        b.export_func(Box::leak(format!("cold_{}", i).into_boxed_str()), *cold);
    }
    b.memory(1, None);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = Instance::instantiate(&module, &registry, Config::default()).unwrap();

    for i in 0..NUM_BODIES {
        for _ in 0..8 {
            let args = [Value::I32(rng.gen()), Value::I32(rng.gen())];
            let mut hot_result = [Value::I32(0)];
            let mut cold_result = [Value::I32(0)];
            instance
                .invoke_export(&format!("hot_{}", i), &args, &mut hot_result)
                .unwrap();
            instance
                .invoke_export(&format!("cold_{}", i), &args, &mut cold_result)
                .unwrap();
            assert_eq!(
                hot_result, cold_result,
                "tier divergence in body {} for {:?}",
                i, args
            );
        }
    }

    // Every HOT body must actually have gone through the generator.
    assert_eq!(instance.jit_cache().len(), NUM_BODIES);
}

#[test]
fn branching_bodies_agree_across_tiers() {
    // A loop summing the argument range, compiled and interpreted.
    fn body() -> Vec<u8> {
        Asm::new()
            .ldc_i32(2, 0) // sum
            .ldc_i32(3, 1) // step
            .label("loop")
            .binop(Opcode::Le, 4, 0, 1)
            .br_ifz(4, "done")
            .binop(Opcode::Add, 2, 2, 0)
            .binop(Opcode::Add, 0, 0, 3)
            .br("loop")
            .label("done")
            .ret(2)
            .finish()
    }

    let mut b = ImageBuilder::new();
    let sig = b.signature(&[ValueType::I32, ValueType::I32], &[ValueType::I32]);
    let hot = b.func(sig, 5, true, body());
    let cold = b.func(sig, 5, false, body());
    b.memory(1, None)
        .export_func("sum_hot", hot)
        .export_func("sum_cold", cold);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = Instance::instantiate(&module, &registry, Config::default()).unwrap();

    for (lo, hi) in [(1, 10), (0, 0), (5, 4), (-3, 3)] {
        let args = [Value::I32(lo), Value::I32(hi)];
        let mut hot_result = [Value::I32(0)];
        let mut cold_result = [Value::I32(0)];
        instance
            .invoke_export("sum_hot", &args, &mut hot_result)
            .unwrap();
        instance
            .invoke_export("sum_cold", &args, &mut cold_result)
            .unwrap();
        assert_eq!(hot_result, cold_result);
    }
    // Spot-check the actual value: 1 + 2 + .. + 10.
    let mut result = [Value::I32(0)];
    instance
        .invoke_export("sum_hot", &[Value::I32(1), Value::I32(10)], &mut result)
        .unwrap();
    assert_eq!(result[0], Value::I32(55));
}
