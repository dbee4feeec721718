use std::sync::Arc;

use pm4_core::{packet::op, regs, CommandError, QueueError};

use crate::common::{
    compute_pipeline, decode, graphics_desc, graphics_pipeline, initialize_test, opcodes,
    register_writes, stream_words, waits, writes_to, TestParameters,
};

#[test]
fn identical_pipelines_share_a_blob_replayed_once() {
    initialize_test(TestParameters::default(), |ctx| {
        let first = graphics_pipeline(&ctx.device, 0);
        let second = graphics_pipeline(&ctx.device, 0);
        assert!(Arc::ptr_eq(first.blob(), second.blob()));
        assert_eq!(ctx.device.pipeline_cache().hits(), 1);

        let masked = ctx
            .device
            .create_pipeline(&graphics_desc(&[(regs::CB_TARGET_MASK, 0xF)]))
            .unwrap();
        assert!(!Arc::ptr_eq(first.blob(), masked.blob()));

        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("blobs"));
        cb.begin().unwrap();
        cb.bind_pipeline(&first).unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.bind_pipeline(&second).unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        let words = stream_words(cb.stream());
        assert_eq!(writes_to(&words, regs::VGT_SHADER_STAGES_EN), 1);

        cb.bind_pipeline(&masked).unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.bind_pipeline(&first).unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.end().unwrap();
        let words = stream_words(cb.stream());
        assert_eq!(writes_to(&words, regs::VGT_SHADER_STAGES_EN), 3);
        assert_eq!(writes_to(&words, regs::CB_TARGET_MASK), 1);
    });
}

#[test]
fn unchanged_dynamic_state_emits_nothing() {
    initialize_test(TestParameters::default(), |ctx| {
        let pipeline = graphics_pipeline(&ctx.device, 0);
        let viewport = pt::Viewport::new(0.0, 0.0, 256.0, 256.0);
        let rect = pt::Rect::new(0, 0, 256, 256);
        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("elision"));
        cb.begin().unwrap();
        cb.bind_pipeline(&pipeline).unwrap();
        cb.set_viewport(viewport).unwrap();
        cb.set_scissor(rect).unwrap();
        cb.set_blend_constants(pt::Color::default()).unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        let before = opcodes(&stream_words(cb.stream()));

        cb.set_viewport(viewport).unwrap();
        cb.set_scissor(rect).unwrap();
        cb.set_blend_constants(pt::Color::default()).unwrap();
        cb.bind_pipeline(&pipeline).unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        let after = opcodes(&stream_words(cb.stream()));

        assert_eq!(&after[..before.len()], &before[..]);
        assert_eq!(&after[before.len()..], &[op::DRAW_INDEX_AUTO]);
        cb.end().unwrap();
    });
}

#[test]
fn dynamic_state_survives_a_pipeline_switch() {
    initialize_test(TestParameters::default(), |ctx| {
        let first = ctx
            .device
            .create_pipeline(&graphics_desc(&[
                (regs::CB_TARGET_MASK, 0),
                (regs::DB_STENCILREFMASK, 0xFF_FF00),
            ]))
            .unwrap();
        let second = ctx
            .device
            .create_pipeline(&graphics_desc(&[
                (regs::CB_TARGET_MASK, 0),
                (regs::DB_STENCILREFMASK, 0xFF_0F00),
            ]))
            .unwrap();
        let target = pt::Image::linear(
            0x40_0000,
            pt::Extent3d {
                width: 64,
                height: 64,
                depth: 1,
            },
            pt::ImageFormat::Rgba8Unorm,
        );

        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("switch"));
        cb.begin().unwrap();
        cb.bind_targets(&[target], None).unwrap();
        cb.bind_pipeline(&first).unwrap();
        cb.set_stencil_reference(5, 5).unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.bind_pipeline(&second).unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.end().unwrap();

        let writes = register_writes(&stream_words(cb.stream()));
        let values = |reg| {
            writes
                .iter()
                .filter(|&&(r, _)| r == reg)
                .map(|&(_, value)| value)
                .collect::<Vec<_>>()
        };
        assert_eq!(
            values(regs::DB_STENCILREFMASK),
            vec![0xFF_FF00, 0xFF_FF05, 0xFF_0F00, 0xFF_0F05]
        );
        assert_eq!(values(regs::CB_TARGET_MASK), vec![0, 0xF, 0, 0xF]);
    });
}

#[test]
fn lifecycle_misuse_does_not_poison() {
    initialize_test(TestParameters::default(), |ctx| {
        let pipeline = graphics_pipeline(&ctx.device, 0);
        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("lifecycle"));

        assert!(matches!(
            cb.draw(3, 1, 0, 0),
            Err(CommandError::InvalidArgument(_))
        ));
        assert!(matches!(cb.end(), Err(CommandError::InvalidArgument(_))));
        assert!(cb.poison().is_none());

        cb.begin().unwrap();
        assert!(matches!(cb.begin(), Err(CommandError::InvalidArgument(_))));
        assert!(cb.is_recording());
        assert!(matches!(
            ctx.queue.submit(&[&cb], &[], None),
            Err(QueueError::InvalidArgument(_))
        ));

        cb.bind_pipeline(&pipeline).unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.end().unwrap();
        assert!(cb.is_executable());
        assert!(matches!(
            cb.bind_pipeline(&pipeline),
            Err(CommandError::InvalidArgument(_))
        ));
        assert!(cb.poison().is_none());
        ctx.queue.submit(&[&cb], &[], None).unwrap();

        let other = ctx.device.create_queue(pt::EngineType::Universal).unwrap();
        assert!(matches!(
            other.submit(&[&cb], &[], None),
            Err(QueueError::InvalidArgument(_))
        ));
    });
}

#[test]
fn user_data_past_the_fast_limit_is_spilled_once() {
    let settings = pt::Settings {
        fast_user_data_limit: 2,
        ..pt::Settings::default()
    };
    initialize_test(TestParameters::default().settings(settings), |ctx| {
        let pipeline = graphics_pipeline(&ctx.device, 0);
        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("spill"));
        cb.begin().unwrap();
        cb.bind_pipeline(&pipeline).unwrap();
        cb.set_user_data(pt::PipelineBindPoint::Graphics, 0, &[1, 2, 3, 4])
            .unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.draw(3, 1, 0, 0).unwrap();

        let words = stream_words(cb.stream());
        let spills = decode(&words)
            .iter()
            .filter(|p| p.opcode() == op::WRITE_DATA)
            .map(|p| p.body()[3..].to_vec())
            .collect::<Vec<_>>();
        assert_eq!(spills, vec![vec![3, 4]]);

        cb.set_user_data(pt::PipelineBindPoint::Graphics, 3, &[9])
            .unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.end().unwrap();
        let words = stream_words(cb.stream());
        let spills = decode(&words)
            .iter()
            .filter(|p| p.opcode() == op::WRITE_DATA)
            .count();
        assert_eq!(spills, 2);
    });
}

#[test]
fn indirect_draw_waits_for_cp_writes() {
    initialize_test(TestParameters::default(), |ctx| {
        let pipeline = graphics_pipeline(&ctx.device, 0);
        let args = pt::Buffer::new(0x20_0000, 256);
        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("indirect"));
        cb.begin().unwrap();
        cb.bind_pipeline(&pipeline).unwrap();
        cb.fill_buffer(args, 0, 64, 0).unwrap();
        cb.draw_indirect(args, 0, 1, 0).unwrap();
        cb.end().unwrap();

        let ops = opcodes(&stream_words(cb.stream()));
        let position = |code| ops.iter().position(|&o| o == code).unwrap();
        let fill = position(op::DMA_DATA);
        let wait = position(op::WAIT_REG_MEM64);
        let sync = position(op::PFP_SYNC_ME);
        let draw = position(op::DRAW_INDIRECT_MULTI);
        assert!(fill < wait);
        assert_eq!(sync, wait + 1);
        assert!(sync < draw);
    });
}

#[test]
fn each_stream_waits_for_cp_writes_itself() {
    initialize_test(TestParameters::default(), |ctx| {
        let graphics = graphics_pipeline(&ctx.device, 0);
        let compute = compute_pipeline(&ctx.device, true);
        let args = pt::Buffer::new(0x20_0000, 256);
        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("lanes"));
        cb.begin().unwrap();
        cb.bind_pipeline(&graphics).unwrap();
        cb.bind_pipeline(&compute).unwrap();
        cb.write_immediate(args.address, 1).unwrap();
        cb.dispatch_indirect(args, 0).unwrap();
        cb.draw_indirect(args, 0, 1, 0).unwrap();
        cb.draw_indirect(args, 0, 1, 0).unwrap();
        cb.end().unwrap();

        let ace_words = stream_words(cb.ace_stream().unwrap());
        assert!(!opcodes(&ace_words).contains(&op::PFP_SYNC_ME));
        // A handoff from the graphics stream, then the write.
        let ace_waits = waits(&ace_words);
        assert_eq!(ace_waits.len(), 2);
        let write = ace_waits[1];

        let words = stream_words(cb.stream());
        assert!(waits(&words).contains(&write));
        let ops = opcodes(&words);
        let draw = ops
            .iter()
            .position(|&o| o == op::DRAW_INDIRECT_MULTI)
            .unwrap();
        let sync = ops.iter().position(|&o| o == op::PFP_SYNC_ME).unwrap();
        assert!(sync < draw);
        assert_eq!(ops[sync - 1], op::WAIT_REG_MEM64);
        assert_eq!(ops.iter().filter(|&&o| o == op::PFP_SYNC_ME).count(), 1);
    });
}

#[test]
fn indirect_draw_without_cp_writes_does_not_wait() {
    initialize_test(TestParameters::default(), |ctx| {
        let pipeline = graphics_pipeline(&ctx.device, 0);
        let args = pt::Buffer::new(0x20_0000, 256);
        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("indirect"));
        cb.begin().unwrap();
        cb.bind_pipeline(&pipeline).unwrap();
        cb.fill_buffer(args, 128, 64, 0).unwrap();
        cb.draw_indirect(args, 0, 1, 0).unwrap();
        assert!(matches!(
            cb.draw_indirect(args, 248, 1, 0),
            Err(CommandError::InvalidArgument(_))
        ));

        let ops = opcodes(&stream_words(cb.stream()));
        assert!(!ops.contains(&op::WAIT_REG_MEM64));
        assert!(ops.contains(&op::DRAW_INDIRECT_MULTI));
    });
}

#[test]
fn zero_count_draw_still_flushes_the_barrier() {
    initialize_test(TestParameters::default(), |ctx| {
        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("empty draw"));
        cb.begin().unwrap();
        cb.barrier(
            pt::AccessFlags::SHADER_WRITE,
            pt::AccessFlags::SHADER_READ,
            &[],
        )
        .unwrap();
        cb.draw(0, 1, 0, 0).unwrap();
        cb.end().unwrap();

        let ops = opcodes(&stream_words(cb.stream()));
        assert!(ops.contains(&op::ACQUIRE_MEM));
        assert!(!ops.contains(&op::DRAW_INDEX_AUTO));
        let stats = cb.stats().unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.draws, 0);
    });
}

#[test]
fn indexed_draws_program_the_index_buffer_once() {
    initialize_test(TestParameters::default(), |ctx| {
        let pipeline = graphics_pipeline(&ctx.device, 0);
        let first = pt::Buffer::new(0x30_0000, 0x600);
        let second = pt::Buffer::new(0x40_0000, 0x600);
        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("indexed"));
        cb.begin().unwrap();
        cb.bind_pipeline(&pipeline).unwrap();
        cb.bind_index_buffer(first, 0, pt::IndexFormat::Uint16)
            .unwrap();
        cb.draw_indexed(6, 1, 0, 0, 0).unwrap();
        cb.draw_indexed(6, 1, 6, 0, 0).unwrap();
        cb.bind_index_buffer(second, 0, pt::IndexFormat::Uint32)
            .unwrap();
        cb.draw_indexed(6, 2, 0, 0, 0).unwrap();
        cb.end().unwrap();

        let words = stream_words(cb.stream());
        let ops = opcodes(&words);
        let count = |code| ops.iter().filter(|&&o| o == code).count();
        assert_eq!(count(op::DRAW_INDEX_2), 3);
        assert_eq!(count(op::INDEX_BASE), 2);
        assert_eq!(count(op::INDEX_BUFFER_SIZE), 2);
        assert_eq!(count(op::NUM_INSTANCES), 2);
        assert_eq!(writes_to(&words, regs::VGT_INDEX_TYPE), 2);

        let draws = decode(&words)
            .into_iter()
            .filter(|p| p.opcode() == op::DRAW_INDEX_2)
            .collect::<Vec<_>>();
        // 0x600 bytes of 16-bit indices, the second draw starting 6 in.
        assert_eq!(draws[0].body()[0], 0x300);
        assert_eq!(draws[1].body()[0], 0x300 - 6);
        assert_eq!(draws[1].body()[1], 0x30_0000 + 12);
        assert_eq!(draws[2].body()[0], 0x180);
    });
}

#[test]
fn compute_queue_records_dispatches_only() {
    initialize_test(TestParameters::default().compute(), |ctx| {
        let compute = compute_pipeline(&ctx.device, true);
        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("compute"));
        cb.begin().unwrap();
        cb.bind_pipeline(&compute).unwrap();
        cb.dispatch(4, 4, 1).unwrap();
        cb.dispatch(0, 4, 1).unwrap();
        cb.end().unwrap();
        assert!(cb.ace_stream().is_none());

        let words = stream_words(cb.stream());
        let dispatches = decode(&words)
            .into_iter()
            .filter(|p| p.opcode() == op::DISPATCH_DIRECT)
            .collect::<Vec<_>>();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(&dispatches[0].body()[..3], &[4, 4, 1]);
        assert_eq!(writes_to(&words, regs::COMPUTE_NUM_THREAD_X), 1);
        assert_eq!(cb.stats().unwrap().skipped, 1);
        ctx.queue.submit(&[&cb], &[], None).unwrap();

        let mut graphics = ctx.device.create_command_buffer(&ctx.queue, Some("graphics"));
        graphics.begin().unwrap();
        assert!(matches!(
            graphics.draw(3, 1, 0, 0),
            Err(CommandError::InvalidArgument(_))
        ));
    });
}
