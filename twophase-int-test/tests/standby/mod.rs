mod standby_test;
