mod crash_recovery_test;
mod corruption_test;
