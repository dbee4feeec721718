use pm4_core::{
    encode::IB_SIZE_MASK,
    packet::op,
    queue::{ACE_SET_VALUE, GFX_SET_VALUE},
    regs, CommandError, DeviceError, QueueError,
};

use crate::common::{
    compute_pipeline, decode, graphics_pipeline, ib_words, initialize_test, opcodes,
    register_writes, releases, stream_words, waits, writes_to, TestParameters,
};

#[test]
fn single_draw_records_state_then_draw() {
    initialize_test(TestParameters::default(), |ctx| {
        let pipeline = graphics_pipeline(&ctx.device, 0);
        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("single draw"));
        cb.begin().unwrap();
        cb.bind_pipeline(&pipeline).unwrap();
        cb.set_viewport(pt::Viewport::new(0.0, 0.0, 800.0, 600.0))
            .unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.end().unwrap();

        let words = stream_words(cb.stream());
        let packets = decode(&words);
        let draw = packets
            .iter()
            .rev()
            .find(|p| p.opcode() != op::NOP)
            .unwrap();
        assert_eq!(draw.opcode(), op::DRAW_INDEX_AUTO);
        assert_eq!(draw.body()[0], 3);
        assert_eq!(writes_to(&words, regs::PA_CL_VPORT_XSCALE), 1);
        assert_eq!(writes_to(&words, regs::PA_SC_VPORT_ZMIN_0), 1);
        assert_eq!(writes_to(&words, regs::VGT_SHADER_STAGES_EN), 1);

        let stats = cb.stats().unwrap();
        assert_eq!(stats.draws, 1);
        assert_eq!(stats.dropped_calls, 0);
    });
}

#[test]
fn repeated_scissor_is_written_once() {
    initialize_test(TestParameters::default(), |ctx| {
        let pipeline = graphics_pipeline(&ctx.device, 0);
        let rect = pt::Rect::new(0, 0, 64, 64);
        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("scissor"));
        cb.begin().unwrap();
        cb.bind_pipeline(&pipeline).unwrap();
        cb.set_scissor(rect).unwrap();
        cb.set_scissor(rect).unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.end().unwrap();

        let words = stream_words(cb.stream());
        let covering = decode(&words)
            .iter()
            .filter_map(|p| Some((p.first_register()?, p.body().len() as u32 - 1)))
            .filter(|&(first, count)| {
                (first..first + count).contains(&regs::PA_SC_VPORT_SCISSOR_0_TL)
            })
            .count();
        assert_eq!(covering, 1);
        assert_eq!(writes_to(&words, regs::PA_SC_VPORT_SCISSOR_0_TL), 1);
        assert_eq!(writes_to(&words, regs::PA_SC_VPORT_SCISSOR_0_TL + 1), 1);
    });
}

#[test]
fn full_chunks_chain_to_their_successor() {
    let settings = pt::Settings {
        chunk_dwords: 256,
        ..pt::Settings::default()
    };
    initialize_test(TestParameters::default().settings(settings), |ctx| {
        let pipeline = graphics_pipeline(&ctx.device, 0);
        let index = pt::Buffer::new(0x10_0000, 0x1000);
        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("chain"));
        cb.begin().unwrap();
        cb.bind_pipeline(&pipeline).unwrap();
        cb.bind_index_buffer(index, 0, pt::IndexFormat::Uint16)
            .unwrap();
        while cb.stream().chunks().len() < 3 {
            cb.draw_indexed(3, 1, 0, 0, 0).unwrap();
        }
        cb.end().unwrap();

        let chunks = cb.stream().chunks();
        for (chunk, next) in chunks.iter().zip(chunks.iter().skip(1)) {
            let packets = decode(chunk.words());
            let consumed: usize = packets.iter().map(|p| p.len()).sum();
            assert_eq!(consumed, chunk.used() as usize);
            let last = packets.last().unwrap();
            assert_eq!(last.opcode(), op::INDIRECT_BUFFER);
            assert_eq!(last.body()[0], next.gpu_addr() as u32);
            assert_eq!(last.body()[1], (next.gpu_addr() >> 32) as u32);
            assert_eq!(last.body()[2] & IB_SIZE_MASK, next.used());
        }
        let tail = chunks.last().unwrap();
        let consumed: usize = decode(tail.words()).iter().map(|p| p.len()).sum();
        assert_eq!(consumed, tail.used() as usize);
    });
}

#[test]
fn ganged_compute_is_bracketed_by_tokens() {
    initialize_test(TestParameters::default(), |ctx| {
        let graphics = graphics_pipeline(&ctx.device, 0);
        let compute = compute_pipeline(&ctx.device, true);
        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("gang"));
        cb.begin().unwrap();
        cb.bind_pipeline(&graphics).unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.bind_pipeline(&compute).unwrap();
        cb.dispatch(64, 1, 1).unwrap();
        cb.end().unwrap();
        assert!(cb.ace_stream().is_some());

        let before = ctx.kernel.submission_count();
        ctx.queue.submit(&[&cb], &[], None).unwrap();
        let submissions = ctx.kernel.submissions();
        assert_eq!(submissions.len(), before + 2);
        let init = &submissions[0];
        let gfx = &submissions[before];
        let ace = &submissions[before + 1];
        assert_eq!(gfx.engine(), pt::EngineType::Universal);
        assert_eq!(ace.engine(), pt::EngineType::Compute);
        assert!(ace.wait.contains(&init.handle));

        let gfx_words = ib_words(&gfx.ibs);
        let ace_words = ib_words(&ace.ibs);

        let prefix_releases = releases(&gfx.ibs[0].words);
        assert_eq!(prefix_releases.len(), 1);
        let (gfx_token, value) = prefix_releases[0];
        assert_eq!(value, GFX_SET_VALUE);
        assert_eq!(
            releases(&gfx_words)
                .iter()
                .filter(|&&(dst, _)| dst == gfx_token)
                .count(),
            1
        );
        assert_eq!(waits(&ace.ibs[0].words), vec![(gfx_token, GFX_SET_VALUE)]);

        let suffix_releases = releases(&ace.ibs.last().unwrap().words);
        assert_eq!(suffix_releases.len(), 1);
        let (ace_token, value) = suffix_releases[0];
        assert_eq!(value, ACE_SET_VALUE);
        assert_eq!(
            releases(&ace_words)
                .iter()
                .filter(|&&(dst, _)| dst == ace_token)
                .count(),
            1
        );
        assert_eq!(
            waits(&gfx_words)
                .iter()
                .filter(|&&wait| wait == (ace_token, ACE_SET_VALUE))
                .count(),
            1
        );

        let postamble = &gfx.ibs.last().unwrap().words;
        let post_ops = opcodes(postamble);
        assert_eq!(post_ops.first(), Some(&op::WAIT_REG_MEM64));
        assert_eq!(post_ops.last(), Some(&op::RELEASE_MEM));
    });
}

#[test]
fn ring_growth_waits_for_idle_and_rewrites_rings() {
    initialize_test(TestParameters::default(), |ctx| {
        let small = graphics_pipeline(&ctx.device, 1024);
        let big = graphics_pipeline(&ctx.device, 4096);
        let vs_bank = ctx.device.hw().user_data.vs;

        let mut first = ctx.device.create_command_buffer(&ctx.queue, Some("small"));
        first.begin().unwrap();
        first.bind_pipeline(&small).unwrap();
        first.draw(3, 1, 0, 0).unwrap();
        first.end().unwrap();
        ctx.queue.submit(&[&first], &[], None).unwrap();
        assert_eq!(ctx.queue.pending_ring_sizes(), None);

        let recorded = ctx.kernel.submissions().pop().unwrap();
        let words = ib_words(&recorded.ibs);
        assert!(waits(&words).is_empty());
        assert_eq!(writes_to(&words, regs::COMPUTE_TMPRING_SIZE), 0);

        let mut second = ctx.device.create_command_buffer(&ctx.queue, Some("big"));
        second.begin().unwrap();
        second.bind_pipeline(&big).unwrap();
        second.draw(3, 1, 0, 0).unwrap();
        second.end().unwrap();
        let pending = ctx.queue.pending_ring_sizes().unwrap();
        assert_eq!(pending.scratch_bytes_per_wave, 4096);

        ctx.queue.submit(&[&second], &[], None).unwrap();
        let recorded = ctx.kernel.submissions().pop().unwrap();
        let prefix = &recorded.ibs[0].words;
        assert_eq!(opcodes(prefix).first(), Some(&op::WAIT_REG_MEM64));
        assert_eq!(writes_to(prefix, regs::COMPUTE_TMPRING_SIZE), 1);
        assert!(register_writes(prefix)
            .iter()
            .any(|&(reg, _)| reg == vs_bank + regs::user_data::RING_TABLE));
        assert_eq!(ctx.queue.ring_sizes().scratch_bytes_per_wave, 4096);
        assert_eq!(ctx.queue.pending_ring_sizes(), None);
    });
}

#[test]
fn out_of_memory_poisons_the_command_buffer() {
    initialize_test(TestParameters::default(), |ctx| {
        let pipeline = graphics_pipeline(&ctx.device, 0);
        let mut cb = ctx.device.create_command_buffer(&ctx.queue, Some("oom"));
        cb.begin().unwrap();
        cb.bind_pipeline(&pipeline).unwrap();

        ctx.allocator.set_failing(true);
        assert_eq!(
            cb.draw(3, 1, 0, 0),
            Err(CommandError::Device(DeviceError::OutOfMemory))
        );
        assert!(cb.poison().is_some());
        assert_eq!(cb.draw(3, 1, 0, 0), Ok(()));
        assert_eq!(
            cb.end(),
            Err(CommandError::Device(DeviceError::OutOfMemory))
        );
        ctx.allocator.set_failing(false);

        let before = ctx.kernel.submission_count();
        assert_eq!(
            ctx.queue.submit(&[&cb], &[], None),
            Err(QueueError::PoisonedCommandBuffer)
        );
        assert_eq!(ctx.kernel.submission_count(), before);

        cb.reset();
        cb.begin().unwrap();
        cb.bind_pipeline(&pipeline).unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.end().unwrap();
        ctx.queue.submit(&[&cb], &[], None).unwrap();
        assert_eq!(ctx.kernel.submission_count(), before + 1);
    });
}
