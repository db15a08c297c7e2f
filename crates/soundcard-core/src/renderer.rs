use soundcard_rt::{
    PositionEvent, SampleFormat, SubBlockGuard, TimingTable, TransportState, WriteSlot,
};

/// The audio graph side of the device.
///
/// `render_period` is called once per writable slot on the producer thread.
/// Position events raised by the consuming side are forwarded on the same
/// thread between two periods.
pub trait Renderer: Send + 'static {
    fn render_period(&mut self, buffer: &mut PeriodBuffer<'_, '_>);

    fn position_changed(&mut self, _position: PositionEvent) {}
}

impl<F> Renderer for F
where
    F: FnMut(&mut PeriodBuffer<'_, '_>) + Send + 'static,
{
    fn render_period(&mut self, buffer: &mut PeriodBuffer<'_, '_>) {
        self(buffer)
    }
}

/// Writes nothing; every period stays silent.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentRenderer;

impl Renderer for SilentRenderer {
    fn render_period(&mut self, buffer: &mut PeriodBuffer<'_, '_>) {
        buffer.silence();
    }
}

/// One writable slot plus the musical position it was requested at.
pub struct PeriodBuffer<'s, 'a> {
    slot: &'s mut WriteSlot<'a>,
    transport: &'s TransportState,
    table: &'s TimingTable,
}

impl<'s, 'a> PeriodBuffer<'s, 'a> {
    pub fn new(
        slot: &'s mut WriteSlot<'a>,
        transport: &'s TransportState,
        table: &'s TimingTable,
    ) -> Self {
        Self {
            slot,
            transport,
            table,
        }
    }

    pub fn frames(&self) -> usize {
        self.slot.frames()
    }

    pub fn channels(&self) -> usize {
        self.slot.channels()
    }

    pub fn format(&self) -> SampleFormat {
        self.slot.format()
    }

    pub fn samplerate(&self) -> u32 {
        self.table.samplerate()
    }

    pub fn write_sample(&mut self, frame: usize, channel: usize, sample: f32) {
        self.slot.write_sample(frame, channel, sample);
    }

    pub fn silence(&mut self) {
        self.slot.silence();
    }

    /// Locks one sub-block so it can be filled from another thread.
    pub fn lock_sub_block(&self, id: usize) -> SubBlockGuard<'_> {
        self.slot.lock_sub_block(id)
    }

    pub fn sub_block_count(&self) -> usize {
        self.slot.sub_block_count()
    }

    pub fn slot(&mut self) -> &mut WriteSlot<'a> {
        self.slot
    }

    pub fn transport(&self) -> &TransportState {
        self.transport
    }

    pub fn table(&self) -> &TimingTable {
        self.table
    }

    pub fn note_offset(&self) -> u64 {
        self.transport.note_offset()
    }

    pub fn delay(&self) -> u32 {
        self.transport.delay(self.table)
    }

    /// Frame of the current period at which the current tick started.
    pub fn attack(&self) -> u32 {
        self.transport.attack(self.table)
    }

    pub fn next_attack(&self) -> u32 {
        self.transport.next_attack(self.table)
    }

    pub fn frames_until_tick(&self) -> u64 {
        self.transport.frames_until_tick(self.table)
    }

    pub fn note_256th_offset(&self, frame: u32) -> u64 {
        self.transport.note_256th_offset(self.table, frame)
    }

    /// Fine attacks of the current tick.
    pub fn fine_attacks(&self) -> &[u32] {
        self.table.fine_256th(self.transport.tic_counter())
    }
}
