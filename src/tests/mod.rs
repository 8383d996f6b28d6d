mod test_bitswarm;
mod test_event;
mod test_fanout;
mod test_origin;
mod test_rate_limiter;
