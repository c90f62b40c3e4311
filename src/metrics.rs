use opentelemetry::metrics::Meter;
use opentelemetry::{InstrumentationScope, global};
use std::sync::LazyLock;

static METER: LazyLock<Meter> = LazyLock::new(|| {
    let scope = InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .build();
    global::meter_with_scope(scope)
});

pub(crate) mod open_connections {
    use crate::metrics::METER;
    use opentelemetry::metrics::UpDownCounter;
    use std::sync::LazyLock;

    static INSTRUMENT: LazyLock<UpDownCounter<i64>> = LazyLock::new(|| {
        METER
            .i64_up_down_counter("open_connections")
            .with_description("The number of currently open connections")
            .build()
    });

    pub(crate) fn inc() {
        INSTRUMENT.add(1, &[])
    }

    pub(crate) fn dec() {
        INSTRUMENT.add(-1, &[])
    }
}

pub(crate) mod accepted_connections {
    use crate::metrics::METER;
    use opentelemetry::metrics::Counter;
    use std::sync::LazyLock;

    static INSTRUMENT: LazyLock<Counter<u64>> = LazyLock::new(|| {
        METER
            .u64_counter("accepted_connections")
            .with_description("The number of connections accepted since startup")
            .build()
    });

    pub(crate) fn inc() {
        INSTRUMENT.add(1, &[])
    }
}

pub(crate) mod forwarded_bytes {
    use crate::metrics::METER;
    use opentelemetry::KeyValue;
    use opentelemetry::metrics::Counter;
    use std::sync::LazyLock;

    static INSTRUMENT: LazyLock<Counter<u64>> = LazyLock::new(|| {
        METER
            .u64_counter("forwarded_bytes")
            .with_description("The number of bytes forwarded between clients and backends")
            .with_unit("bytes")
            .build()
    });

    pub(crate) fn record_serverbound(amount: u64) {
        INSTRUMENT.add(amount, &[KeyValue::new("bound", "serverbound")])
    }

    pub(crate) fn record_clientbound(amount: u64) {
        INSTRUMENT.add(amount, &[KeyValue::new("bound", "clientbound")])
    }
}
